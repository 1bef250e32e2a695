//! Overlay merge rule for layered YAML documents.

use serde_yaml::Value;

/// Merges `overlay` into `base`.
///
/// Map values merge key by key: map-on-map recurses, sequence-on-sequence
/// concatenates in overlay-appended order, anything else replaces the base
/// value. Non-map roots follow the same scalar/sequence rules.
pub(crate) fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(existing) = base_map.get_mut(&key) {
                    merge_values(existing, value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (Value::Sequence(base_seq), Value::Sequence(overlay_seq)) => {
            base_seq.extend(overlay_seq);
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn maps_recurse_and_scalars_replace() {
        let mut base = parse("agent:\n  manager_ip: 10.0.0.1\n  retry: 5s\n");
        merge_values(&mut base, parse("agent:\n  manager_ip: 10.0.0.2\n"));

        assert_eq!(base["agent"]["manager_ip"], parse("10.0.0.2"));
        assert_eq!(base["agent"]["retry"], parse("5s"));
    }

    #[test]
    fn sequences_concatenate_in_order() {
        let mut base = parse("paths:\n  - /var/log/a\n  - /var/log/b\n");
        merge_values(&mut base, parse("paths:\n  - /var/log/c\n"));

        let paths = base["paths"].as_sequence().unwrap();
        let collected: Vec<_> = paths.iter().filter_map(Value::as_str).collect();
        assert_eq!(collected, ["/var/log/a", "/var/log/b", "/var/log/c"]);
    }

    #[test]
    fn new_keys_are_added() {
        let mut base = parse("agent: {}\n");
        merge_values(&mut base, parse("logcollector:\n  enabled: true\n"));
        assert_eq!(base["logcollector"]["enabled"], Value::Bool(true));
    }

    #[test]
    fn map_on_map_merge_is_associative() {
        let a = parse("x:\n  p: 1\n");
        let b = parse("x:\n  q: 2\n");
        let c = parse("x:\n  r: 3\n");

        let mut left = a.clone();
        merge_values(&mut left, b.clone());
        merge_values(&mut left, c.clone());

        let mut bc = b;
        merge_values(&mut bc, c);
        let mut right = a;
        merge_values(&mut right, bc);

        assert_eq!(left, right);
    }
}
