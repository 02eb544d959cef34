use crate::contract::Event;

/// Hive-style partition directory for archived events.
pub fn archive_partition_prefix(
    base_prefix: &str,
    source: &str,
    detail_type: &str,
    event_date: &str,
) -> String {
    let trimmed = base_prefix.trim_matches('/');
    let partitions = format!(
        "source={}/detail_type={}/event_date={event_date}",
        partition_value(source),
        partition_value(detail_type),
    );
    if trimmed.is_empty() {
        partitions
    } else {
        format!("{trimmed}/{partitions}")
    }
}

pub fn archive_object_key(base_prefix: &str, event: &Event) -> String {
    let event_date = event.timestamp.format("%Y-%m-%d").to_string();
    format!(
        "{}/{}.json",
        archive_partition_prefix(base_prefix, &event.source, &event.detail_type, &event_date),
        event.id
    )
}

fn partition_value(value: &str) -> String {
    value.replace(['/', '='], "_")
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::contract::Detail;

    #[test]
    fn object_key_is_partitioned_by_source_type_and_date() {
        let timestamp = DateTime::parse_from_rfc3339("2026-10-17T23:59:59Z")
            .expect("timestamp should parse")
            .with_timezone(&Utc);
        let mut event = Event::new("myapp", "order", Detail::new(), timestamp);
        event.id = "evt-1".to_string();

        assert_eq!(
            archive_object_key("/relay/archive/", &event),
            "relay/archive/source=myapp/detail_type=order/event_date=2026-10-17/evt-1.json"
        );
    }

    #[test]
    fn empty_prefix_and_unsafe_values_are_handled() {
        assert_eq!(
            archive_partition_prefix("", "a/b", "x=y", "2026-10-17"),
            "source=a_b/detail_type=x_y/event_date=2026-10-17"
        );
    }
}
