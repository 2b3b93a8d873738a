use proptest::prelude::*;
use sluice_kcp::Conversation;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever byte sequence goes in one side comes out the other, intact
    /// and in order, regardless of how the writes were sliced.
    #[test]
    fn byte_stream_preserved_across_arbitrary_writes(
        writes in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..800),
            1..20,
        )
    ) {
        let mut a = Conversation::new(1, true);
        let mut b = Conversation::new(1, true);
        a.set_nodelay(true, 10, 2, true);
        b.set_nodelay(true, 10, 2, true);

        let total: Vec<u8> = writes.concat();
        for w in &writes {
            a.send(w).unwrap();
        }

        let mut clock = 0u32;
        let mut got = Vec::new();
        let mut buf = vec![0u8; 65536];
        for _ in 0..200 {
            clock += 10;
            let mut out = Vec::new();
            a.update_now(clock, &mut |p| out.push(p.to_vec()));
            for p in out {
                b.input(&p, true).unwrap();
            }
            let mut out = Vec::new();
            b.update_now(clock, &mut |p| out.push(p.to_vec()));
            for p in out {
                a.input(&p, true).unwrap();
            }
            while let Ok(n) = b.recv(&mut buf) {
                got.extend_from_slice(&buf[..n]);
            }
            if got.len() >= total.len() {
                break;
            }
        }
        prop_assert_eq!(got, total);
    }
}
