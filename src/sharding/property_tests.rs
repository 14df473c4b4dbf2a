//! Property tests for the shard/gather round-trip law

#[cfg(test)]
mod tests {
    use crate::sharding::*;
    use crate::tree::{DType, Leaf, LeafShape, Tree, TreeShape};
    use proptest::prelude::*;

    // ============================================================
    // Generators
    // ============================================================

    /// (dp, mp) axis sizes
    fn arb_mesh() -> impl Strategy<Value = (usize, usize)> {
        (1usize..=3, 1usize..=3)
    }

    /// A leaf shape whose dims are multiples of the mesh sizes where sharded,
    /// plus the spec that shards them.
    fn arb_case() -> impl Strategy<Value = (usize, usize, Vec<usize>, Vec<Option<&'static str>>, DType)> {
        arb_mesh().prop_flat_map(|(dp, mp)| {
            let labels = prop_oneof![Just(None), Just(Some("dp")), Just(Some("mp"))];
            (
                Just(dp),
                Just(mp),
                proptest::collection::vec((1usize..=3, labels), 0..=3),
                prop_oneof![Just(DType::F32), Just(DType::F64), Just(DType::I32), Just(DType::U8)],
            )
        })
        .prop_map(|(dp, mp, dims, dtype)| {
            let mut used = Vec::new();
            let mut shape = Vec::new();
            let mut spec = Vec::new();
            for (mult, label) in dims {
                let label = label.filter(|l| !used.contains(l));
                let size = match label {
                    Some("dp") => mult * dp,
                    Some(_) => mult * mp,
                    None => mult,
                };
                if let Some(l) = label {
                    used.push(l);
                }
                shape.push(size);
                spec.push(label);
            }
            (dp, mp, shape, spec, dtype)
        })
    }

    fn leaf_with_values(shape: &[usize], dtype: DType, seed: u64) -> Leaf {
        let n: usize = shape.iter().product();
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            state >> 33
        };
        let leaf = match dtype {
            DType::F32 => Leaf::f32(shape, (0..n).map(|_| next() as f32 * 0.25 - 1.0e6).collect()),
            DType::F64 => Leaf::f64(shape, (0..n).map(|_| next() as f64 * -0.125).collect()),
            DType::I32 => Leaf::i32(shape, (0..n).map(|_| next() as i32).collect()),
            DType::I64 => Leaf::i64(shape, (0..n).map(|_| next() as i64).collect()),
            DType::U8 => Leaf::u8(shape, (0..n).map(|_| next() as u8).collect()),
        };
        leaf.unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_gather_inverts_shard((dp, mp, shape, spec, dtype) in arb_case(), seed in any::<u64>()) {
            let mesh = Mesh::parse(&format!("dp={dp},mp={mp}"), dp * mp).unwrap();
            let mut shapes = TreeShape::new();
            shapes.insert("x", LeafShape::new(shape.clone(), dtype));
            let mut specs = Tree::new();
            specs.insert("x", PartitionSpec::from_axes(spec));
            let fns = ShardGatherFns::build(&specs, &shapes, &mesh).unwrap();

            let x = leaf_with_values(&shape, dtype, seed);
            let sharded = fns.shard.get("x").unwrap().apply(&x).unwrap();
            prop_assert_eq!(sharded.shards().len(), dp * mp);
            let back = fns.gather.get("x").unwrap().apply(&sharded).unwrap();
            prop_assert_eq!(back.dtype(), dtype);
            prop_assert!(back.same_bits(&x));
        }

        #[test]
        fn prop_resolution_is_deterministic(n in 1usize..6) {
            let rules = vec![
                PartitionRule::new(r"layer_[02468]\.w", PartitionSpec::from_axes([Some("dp")])).unwrap(),
            ];
            let mut shapes = TreeShape::new();
            for i in 0..n {
                shapes.insert(format!("layer_{i}.w"), LeafShape::new([4], DType::F32));
            }
            let first = resolve(&rules, &shapes).map_err(|e| e.to_string());
            let second = resolve(&rules, &shapes).map_err(|e| e.to_string());
            prop_assert_eq!(first.clone(), second);
            if n > 1 {
                prop_assert_eq!(first.unwrap_err(), "No partition rule matches parameter 'layer_1.w'");
            }
        }
    }
}
