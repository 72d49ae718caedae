use std::collections::HashMap;

use log::warn;

use crate::{
    error::AggregationError,
    partition::ShardAssignment,
    report::{FailureReason, PartialResult, Status},
};

/// The combination of every valid partial result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub loss: f64,
    pub grad: Vec<f32>,
    pub sample_count: usize,
    pub contributors: Vec<String>,
    pub dropped: Vec<(String, FailureReason)>,
}

/// Checks an `Ok` result against what its worker was asked to do.
fn validate(
    assignment: &ShardAssignment,
    result: &PartialResult,
    grad_len: usize,
) -> Result<(), FailureReason> {
    let expected = assignment.sample_range.len();

    if result.sample_count != expected {
        return Err(FailureReason::Corrupt(format!(
            "reported {} samples for a shard of {expected}",
            result.sample_count
        )));
    }

    if !result.loss.is_finite() {
        return Err(FailureReason::Corrupt(format!(
            "loss is {}",
            result.loss
        )));
    }

    if result.grad_update.len() != grad_len {
        return Err(FailureReason::Corrupt(format!(
            "gradient of {} values for {grad_len} parameters",
            result.grad_update.len()
        )));
    }

    if result.grad_update.iter().any(|g| !g.is_finite()) {
        return Err(FailureReason::Corrupt("gradient is not finite".into()));
    }

    Ok(())
}

/// Combines the partial results of a run.
///
/// The loss is the sample weighted mean of the contributors' losses and the gradient
/// the sample weighted mean of their gradients. Results are combined in the order of
/// `order`, no matter the order they arrived in.
///
/// # Arguments
/// * `order` - The assignments of the run, in configuration order.
/// * `results` - One result per assignment.
/// * `grad_len` - The amount of parameters of the model.
///
/// # Returns
/// The aggregate, or an `AggregationError` if no result survived validation.
pub fn aggregate(
    order: &[ShardAssignment],
    results: Vec<PartialResult>,
    grad_len: usize,
) -> Result<Aggregate, AggregationError> {
    let mut by_owner: HashMap<String, PartialResult> =
        results.into_iter().map(|r| (r.owner.clone(), r)).collect();

    let mut accepted = Vec::with_capacity(order.len());
    let mut dropped = Vec::new();

    for assignment in order {
        let owner = &assignment.owner;

        let Some(result) = by_owner.remove(owner) else {
            dropped.push((
                owner.clone(),
                FailureReason::Protocol("no result for the shard".into()),
            ));
            continue;
        };

        let verdict = match &result.status {
            Status::Ok => validate(assignment, &result, grad_len),
            Status::Failed(reason) => Err(reason.clone()),
        };

        match verdict {
            Ok(()) => accepted.push(result),
            Err(reason) => dropped.push((owner.clone(), reason)),
        }
    }

    if accepted.is_empty() {
        return Err(AggregationError { dropped });
    }

    let sample_count: usize = accepted.iter().map(|r| r.sample_count).sum();
    let total = sample_count as f64;

    let loss = accepted
        .iter()
        .map(|r| r.loss * r.sample_count as f64)
        .sum::<f64>()
        / total;

    let mut grad = vec![0.0f64; grad_len];
    for r in &accepted {
        let weight = r.sample_count as f64 / total;
        grad.iter_mut()
            .zip(&r.grad_update)
            .for_each(|(acc, &g)| *acc += weight * g as f64);
    }

    if !dropped.is_empty() {
        let names: Vec<&str> = dropped.iter().map(|(name, _)| name.as_str()).collect();
        warn!(
            "degraded run: {} of {} worker(s) dropped: {}",
            dropped.len(),
            order.len(),
            names.join(", ")
        );
    }

    Ok(Aggregate {
        loss,
        grad: grad.into_iter().map(|g| g as f32).collect(),
        sample_count,
        contributors: accepted.into_iter().map(|r| r.owner).collect(),
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignments(sizes: &[(&str, usize)]) -> Vec<ShardAssignment> {
        let mut start = 0;
        sizes
            .iter()
            .map(|&(owner, n)| {
                let sample_range = start..start + n;
                start += n;
                ShardAssignment {
                    owner: owner.into(),
                    sample_range,
                }
            })
            .collect()
    }

    #[test]
    fn equal_losses_average_to_themselves() {
        let order = assignments(&[("a", 4), ("b", 4)]);
        let results = vec![
            PartialResult::ok("a", 2.0, vec![1.0], 4),
            PartialResult::ok("b", 2.0, vec![3.0], 4),
        ];

        let agg = aggregate(&order, results, 1).unwrap();
        assert_eq!(agg.loss, 2.0);
        assert_eq!(agg.grad, [2.0]);
        assert_eq!(agg.sample_count, 8);
    }

    #[test]
    fn losses_are_weighted_by_samples() {
        let order = assignments(&[("a", 6), ("b", 2)]);
        let results = vec![
            PartialResult::ok("a", 1.0, vec![0.0], 6),
            PartialResult::ok("b", 4.0, vec![4.0], 2),
        ];

        let agg = aggregate(&order, results, 1).unwrap();
        assert_eq!(agg.loss, 1.75);
        assert_eq!(agg.grad, [1.0]);
    }

    #[test]
    fn arrival_order_does_not_matter() {
        let order = assignments(&[("a", 1), ("b", 2), ("c", 3)]);
        let results = vec![
            PartialResult::ok("c", 0.3, vec![0.3, 3.0], 3),
            PartialResult::ok("a", 0.1, vec![0.1, 1.0], 1),
            PartialResult::ok("b", 0.2, vec![0.2, 2.0], 2),
        ];

        let mut reversed = results.clone();
        reversed.reverse();

        let one = aggregate(&order, results, 2).unwrap();
        let two = aggregate(&order, reversed, 2).unwrap();
        assert_eq!(one, two);
        assert_eq!(one.contributors, ["a", "b", "c"]);
    }

    #[test]
    fn failed_workers_are_left_out() {
        let order = assignments(&[("a", 2), ("b", 2)]);
        let results = vec![
            PartialResult::ok("a", 1.0, vec![1.0], 2),
            PartialResult::failed("b", FailureReason::Timeout),
        ];

        let agg = aggregate(&order, results, 1).unwrap();
        assert_eq!(agg.loss, 1.0);
        assert_eq!(agg.contributors, ["a"]);
        assert_eq!(agg.dropped, [("b".to_string(), FailureReason::Timeout)]);
    }

    #[test]
    fn invalid_results_are_demoted() {
        let order = assignments(&[("a", 2), ("b", 2), ("c", 2), ("d", 2)]);
        let results = vec![
            PartialResult::ok("a", 1.0, vec![1.0], 3),
            PartialResult::ok("b", f64::NAN, vec![1.0], 2),
            PartialResult::ok("c", 1.0, vec![1.0, 2.0], 2),
            PartialResult::ok("d", 5.0, vec![2.0], 2),
        ];

        let agg = aggregate(&order, results, 1).unwrap();
        assert_eq!(agg.contributors, ["d"]);
        assert_eq!(agg.loss, 5.0);
        assert!(
            agg.dropped
                .iter()
                .all(|(_, reason)| matches!(reason, FailureReason::Corrupt(_)))
        );
    }

    #[test]
    fn nothing_to_aggregate() {
        let order = assignments(&[("a", 1), ("b", 1)]);
        let results = vec![
            PartialResult::failed("a", FailureReason::Remote("boom".into())),
            PartialResult::failed("b", FailureReason::Timeout),
        ];

        let err = aggregate(&order, results, 1).unwrap_err();
        assert_eq!(err.dropped.len(), 2);
    }
}
