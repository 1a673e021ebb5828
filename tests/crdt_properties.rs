//! CRDT 合并性质测试
//!
//! 在随机交错的本地操作与副本间同步之后，验证三种类型的合并满足交换律、结合律与幂等性，
//! 以及计数器与集合的语义性质。

use hive::crdt::{GCounter, LwwRegister, OrSet, Tag};
use proptest::prelude::*;

const REPLICAS: usize = 3;
const ELEMENTS: &[&str] = &["a", "b", "c", "d"];

#[derive(Debug, Clone)]
enum Op {
    Increment { replica: usize, by: u64 },
    Add { replica: usize, element: usize },
    Remove { replica: usize, element: usize },
    Set { replica: usize, value: u32 },
    Sync { from: usize, to: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    let replica = 0..REPLICAS;
    let element = 0..ELEMENTS.len();
    prop_oneof![
        (replica.clone(), 1u64..10).prop_map(|(replica, by)| Op::Increment { replica, by }),
        (replica.clone(), element.clone()).prop_map(|(replica, element)| Op::Add { replica, element }),
        (replica.clone(), element).prop_map(|(replica, element)| Op::Remove { replica, element }),
        (replica.clone(), any::<u32>()).prop_map(|(replica, value)| Op::Set { replica, value }),
        (replica.clone(), replica).prop_map(|(from, to)| Op::Sync { from, to }),
    ]
}

#[derive(Debug, Clone, Default)]
struct Replica {
    counter: GCounter,
    set: OrSet<String>,
    register: Option<LwwRegister<u32>>,
    next_seq: u64,
}

fn replica_name(i: usize) -> String {
    format!("r{i}")
}

fn merge_register(a: &Option<LwwRegister<u32>>, b: &Option<LwwRegister<u32>>) -> Option<LwwRegister<u32>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.merge(b)),
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (None, None) => None,
    }
}

impl Replica {
    fn merge(&self, other: &Replica) -> Replica {
        Replica {
            counter: self.counter.merge(&other.counter),
            set: self.set.merge(&other.set),
            register: merge_register(&self.register, &other.register),
            next_seq: self.next_seq,
        }
    }
}

/// 执行操作序列，返回各副本状态与每个写入方的累计自增
fn run(ops: &[Op]) -> (Vec<Replica>, [u64; REPLICAS]) {
    let mut replicas = vec![Replica::default(); REPLICAS];
    let mut totals = [0u64; REPLICAS];

    for (step, op) in ops.iter().enumerate() {
        match op {
            Op::Increment { replica, by } => {
                replicas[*replica].counter.increment(&replica_name(*replica), *by);
                totals[*replica] += by;
            }
            Op::Add { replica, element } => {
                let r = &mut replicas[*replica];
                r.next_seq += 1;
                let tag = Tag::new(replica_name(*replica), r.next_seq);
                r.set.add(ELEMENTS[*element].to_string(), tag);
            }
            Op::Remove { replica, element } => {
                replicas[*replica].set.remove(&ELEMENTS[*element].to_string());
            }
            Op::Set { replica, value } => {
                // 全局步号作为时间戳，保证 (timestamp, writer) 唯一
                let timestamp = step as u64 + 1;
                let r = &mut replicas[*replica];
                match &mut r.register {
                    Some(register) => register.set(*value, timestamp, replica_name(*replica)),
                    None => r.register = Some(LwwRegister::new(*value, timestamp, replica_name(*replica))),
                }
            }
            Op::Sync { from, to } => {
                let merged = replicas[*to].merge(&replicas[*from]);
                replicas[*to] = merged;
            }
        }
    }

    (replicas, totals)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn merge_is_commutative(ops in prop::collection::vec(arb_op(), 0..60)) {
        let (replicas, _) = run(&ops);
        for a in &replicas {
            for b in &replicas {
                prop_assert_eq!(a.counter.merge(&b.counter), b.counter.merge(&a.counter));
                prop_assert_eq!(a.set.merge(&b.set), b.set.merge(&a.set));
                prop_assert_eq!(
                    merge_register(&a.register, &b.register),
                    merge_register(&b.register, &a.register)
                );
            }
        }
    }

    #[test]
    fn merge_is_associative(ops in prop::collection::vec(arb_op(), 0..60)) {
        let (r, _) = run(&ops);
        let (a, b, c) = (&r[0], &r[1], &r[2]);

        prop_assert_eq!(
            a.counter.merge(&b.counter).merge(&c.counter),
            a.counter.merge(&b.counter.merge(&c.counter))
        );
        prop_assert_eq!(a.set.merge(&b.set).merge(&c.set), a.set.merge(&b.set.merge(&c.set)));
        prop_assert_eq!(
            merge_register(&merge_register(&a.register, &b.register), &c.register),
            merge_register(&a.register, &merge_register(&b.register, &c.register))
        );
    }

    #[test]
    fn merge_is_idempotent(ops in prop::collection::vec(arb_op(), 0..60)) {
        let (replicas, _) = run(&ops);
        for a in &replicas {
            prop_assert_eq!(&a.counter.merge(&a.counter), &a.counter);
            prop_assert_eq!(&a.set.merge(&a.set), &a.set);
            prop_assert_eq!(&merge_register(&a.register, &a.register), &a.register);
        }
    }

    #[test]
    fn counter_converges_to_sum_of_writer_maxima(ops in prop::collection::vec(arb_op(), 0..60)) {
        let (replicas, totals) = run(&ops);

        let mut merged = GCounter::new();
        let mut previous = 0;
        for replica in &replicas {
            merged = merged.merge(&replica.counter);
            prop_assert!(merged.value() >= previous);
            previous = merged.value();
        }

        for (i, total) in totals.iter().enumerate() {
            prop_assert_eq!(merged.count_of(&replica_name(i)), *total);
        }
        prop_assert_eq!(merged.value(), totals.iter().sum::<u64>());
    }

    #[test]
    fn observed_remove_wins_over_nothing(element in 0..ELEMENTS.len(), others in prop::collection::vec(arb_op(), 0..30)) {
        // 先在 r0 添加并同步给 r1，r1 删除后再与任意历史合并：该 tag 不会复活
        let (mut replicas, _) = run(&others);
        let name = ELEMENTS[element].to_string();
        let tag = Tag::new("observer", 1);
        replicas[0].set.add(name.clone(), tag.clone());
        replicas[1].set = replicas[1].set.merge(&replicas[0].set);
        replicas[1].set.remove(&name);

        let merged = replicas[0].set.merge(&replicas[1].set).merge(&replicas[2].set);
        prop_assert!(!merged.tags_of(&name).contains(&tag));
    }
}

#[test]
fn unobserved_remove_keeps_concurrent_add() {
    let mut replica_a: OrSet<String> = OrSet::new();
    replica_a.add("a".to_string(), Tag::new("A", 1));

    let mut replica_b: OrSet<String> = OrSet::new();
    replica_b.remove(&"a".to_string());

    let merged = replica_a.merge(&replica_b);
    assert!(merged.contains(&"a".to_string()));
    let expected: std::collections::BTreeSet<Tag> = [Tag::new("A", 1)].into_iter().collect();
    assert_eq!(merged.tags_of(&"a".to_string()), expected);
    assert_eq!(merged, replica_b.merge(&replica_a));
}

#[test]
fn observed_remove_deletes_element() {
    let mut replica_a: OrSet<String> = OrSet::new();
    replica_a.add("a".to_string(), Tag::new("A", 1));

    let mut replica_b = replica_a.clone();
    replica_b.remove(&"a".to_string());

    assert!(!replica_a.merge(&replica_b).contains(&"a".to_string()));
}
