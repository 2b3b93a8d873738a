use proptest::prelude::*;

use sluice::parse_multi_port;

proptest! {
    /// `host:min-max` parses back to exactly `{host, min, max}` for every
    /// ordered pair of valid ports.
    #[test]
    fn range_grammar_roundtrips(a in 1u16..=65535, b in 1u16..=65535) {
        let (min, max) = if a <= b { (a, b) } else { (b, a) };
        let rendered = format!("example.org:{min}-{max}");
        let parsed = parse_multi_port(&rendered).unwrap();
        prop_assert_eq!(parsed.host, "example.org");
        prop_assert_eq!(parsed.min, min);
        prop_assert_eq!(parsed.max, max);
    }

    #[test]
    fn single_port_grammar_roundtrips(p in 1u16..=65535) {
        let parsed = parse_multi_port(&format!("10.1.2.3:{p}")).unwrap();
        prop_assert_eq!(parsed.min, p);
        prop_assert_eq!(parsed.max, p);
    }
}
