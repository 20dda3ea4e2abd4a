use proptest::prelude::*;

use nimbus::{config::NodeConfig, message::LogMessage, state::StateNode, update_queue::UpdateQueue};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
enum Op {
    Push,
    Clear,
    Drain,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Push),
        1 => Just(Op::Clear),
        1 => Just(Op::Drain),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For any interleaving of push/clear/drain, the total counter equals
    /// the number of pushes ever made, and every pushed message is either
    /// returned by exactly one drain, discarded by exactly one clear, or
    /// still live - never duplicated.
    #[test]
    fn counter_equals_pushes_under_any_op_sequence(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();

        let config = NodeConfig::default();
        let (shutdown_tx, _) = broadcast::channel(1);
        let queue = UpdateQueue::start(&config, shutdown_tx.subscribe());
        let node = StateNode::new(&config, queue.sink());

        let mut pushes: u64 = 0;
        let mut drained: Vec<String> = Vec::new();
        let mut cleared: u64 = 0;

        for op in &ops {
            match op {
                Op::Push => {
                    node.push_message(LogMessage::new(format!("m{}", pushes)));
                    pushes += 1;
                }
                Op::Clear => {
                    cleared += node.recent_messages().len() as u64;
                    node.clear_messages();
                }
                Op::Drain => {
                    drained.extend(node.drain_messages().into_iter().map(|m| m.message));
                }
            }
            prop_assert_eq!(node.total_message_count(), pushes);
        }

        // Partition: every push is live, drained, or cleared, exactly once.
        let live = node.recent_messages().len() as u64;
        prop_assert_eq!(live + drained.len() as u64 + cleared, pushes);

        // No message was returned by more than one drain.
        let mut unique = drained.clone();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(unique.len(), drained.len());
    }
}
