/// Correlation ID tying together the events of one certificate
/// acquisition or renewal attempt. Time-ordered, so sorting log lines by
/// correlation ID keeps attempts in sequence.
pub fn correlation_id() -> String {
    uuid::Uuid::now_v7().hyphenated().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn correlation_ids_are_unique_and_parse_as_uuid() {
        let ids: HashSet<String> = (0..100).map(|_| correlation_id()).collect();
        assert_eq!(ids.len(), 100);
        for id in &ids {
            let parsed = uuid::Uuid::parse_str(id).unwrap();
            assert_eq!(parsed.get_version_num(), 7);
        }
    }

    #[test]
    fn later_ids_sort_after_earlier_ones() {
        let first = correlation_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = correlation_id();
        assert!(second > first, "{second} should sort after {first}");
    }
}
