//! Plan repair.

use super::plan::{PlanItem, RawPlan, RoutingPlan, RoutingStep};

/// Proposed orders above this are clamped so injected orders stay in range.
pub const MAX_ORDER: u32 = 1_000_000;

/// Repair a candidate plan.
///
/// 1. Steps without an order take their 1-based array position. Orders are
///    clamped to [`MAX_ORDER`].
/// 2. Every missing mandatory capability is appended, ordered after every
///    existing step and depending on the mandatory capabilities before it.
/// 3. Steps are stable-sorted by order.
///
/// Proposed steps are never removed. Duplicate dependencies within a step
/// are collapsed. Error markers are moved to `errors`.
pub fn normalize(raw: RawPlan, mandatory: &[&str]) -> RoutingPlan {
    let mut slots = raw.len();
    let mut steps = Vec::with_capacity(raw.len() + mandatory.len());
    let mut errors = Vec::new();

    for (index, item) in raw.into_iter().enumerate() {
        match item {
            PlanItem::Step(proposed) => {
                let mut dependencies: Vec<String> = Vec::with_capacity(proposed.dependencies.len());
                for dep in proposed.dependencies {
                    if !dependencies.contains(&dep) {
                        dependencies.push(dep);
                    }
                }
                let task = proposed
                    .task
                    .unwrap_or_else(|| default_task(&proposed.agent));
                let position = u32::try_from(index + 1).unwrap_or(MAX_ORDER);
                let order = proposed.order.unwrap_or(position).min(MAX_ORDER);
                steps.push(RoutingStep {
                    agent: proposed.agent,
                    order,
                    task,
                    dependencies,
                });
            }
            PlanItem::Error { error, raw } => {
                tracing::warn!("Plan entry {} unusable: {} ({:?})", index + 1, error, raw);
                errors.push(error);
            }
        }
    }

    for (position, agent) in mandatory.iter().enumerate() {
        if steps.iter().any(|s| s.agent == *agent) {
            continue;
        }
        let max_order = steps.iter().map(|s| s.order).max().unwrap_or(0);
        let slots_order = u32::try_from(slots).unwrap_or(u32::MAX);
        let order = slots_order.max(max_order).saturating_add(1);
        slots += 1;
        tracing::debug!("Adding mandatory step {} at order {}", agent, order);
        steps.push(
            RoutingStep::new(*agent, order, default_task(agent))
                .with_dependencies(mandatory[..position].iter().copied()),
        );
    }

    steps.sort_by_key(|s| s.order);
    RoutingPlan { steps, errors }
}

/// `Process <name>` for a capability without a task.
fn default_task(agent: &str) -> String {
    let name = agent.strip_suffix("Agent").unwrap_or(agent);
    format!("Process {}", name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::plan::ProposedStep;

    const MANDATORY: [&str; 3] = ["IntentAgent", "AppAgent", "RequestAgent"];

    fn step(agent: &str, order: Option<u32>, deps: &[&str]) -> PlanItem {
        PlanItem::Step(ProposedStep {
            agent: agent.to_string(),
            order,
            task: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        })
    }

    #[test]
    fn appends_missing_mandatory_steps_after_existing_ones() {
        let raw = vec![
            step("CategoryAgent", Some(7), &[]),
            step("UserInteractionAgent", None, &[]),
        ];
        let plan = normalize(raw, &MANDATORY);

        assert_eq!(
            plan.agents(),
            vec!["UserInteractionAgent", "CategoryAgent", "IntentAgent", "AppAgent", "RequestAgent"]
        );
        let orders: Vec<u32> = plan.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![2, 7, 8, 9, 10]);
        assert_eq!(plan.step("AppAgent").unwrap().dependencies, vec!["IntentAgent"]);
        assert_eq!(
            plan.step("RequestAgent").unwrap().dependencies,
            vec!["IntentAgent", "AppAgent"]
        );
        assert_eq!(plan.step("IntentAgent").unwrap().task, "Process intent");
    }

    #[test]
    fn missing_orders_follow_array_position_and_sort_is_stable() {
        let raw = vec![
            step("IntentAgent", None, &[]),
            step("AppAgent", Some(1), &[]),
            step("RequestAgent", None, &["IntentAgent", "IntentAgent"]),
        ];
        let plan = normalize(raw, &MANDATORY);
        assert_eq!(plan.agents(), vec!["IntentAgent", "AppAgent", "RequestAgent"]);
        assert_eq!(plan.steps[2].order, 3);
        assert_eq!(plan.steps[2].dependencies, vec!["IntentAgent"]);
    }

    #[test]
    fn error_marker_still_gets_mandatory_steps() {
        let raw = vec![PlanItem::error("Invalid JSON", Some("not json".into()))];
        let plan = normalize(raw, &MANDATORY);
        assert_eq!(plan.errors, vec!["Invalid JSON"]);
        assert_eq!(plan.agents(), vec!["IntentAgent", "AppAgent", "RequestAgent"]);
        let orders: Vec<u32> = plan.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![2, 3, 4]);
    }

    #[test]
    fn never_drops_steps_even_with_dangling_dependencies() {
        let raw = vec![
            step("IntentAgent", Some(1), &[]),
            step("CategoryAgent", Some(2), &["DynamicModelAgent"]),
            step("CategoryAgent", Some(3), &[]),
        ];
        let plan = normalize(raw, &MANDATORY);
        assert_eq!(plan.steps.len(), 5);
        assert_eq!(plan.step("CategoryAgent").unwrap().dependencies, vec!["DynamicModelAgent"]);
    }

    #[test]
    fn mandatory_orders_strictly_exceed_original_orders() {
        // A handful of shapes, including empty and out-of-range orders.
        let shapes: Vec<RawPlan> = vec![
            vec![],
            vec![step("X", Some(100), &[]), step("Y", None, &[])],
            vec![step("AppAgent", Some(5), &[]), step("Z", Some(2), &[])],
            vec![PlanItem::error("e", None), step("W", Some(1), &[])],
            vec![step("CategoryAgent", Some(u32::MAX), &[])],
            vec![step("X", Some(u32::MAX - 1), &[]), step("IntentAgent", Some(u32::MAX), &[])],
        ];
        for raw in shapes {
            let original_max = raw
                .iter()
                .enumerate()
                .filter_map(|(i, item)| match item {
                    PlanItem::Step(s) => Some(s.order.unwrap_or(i as u32 + 1).min(MAX_ORDER)),
                    PlanItem::Error { .. } => None,
                })
                .max()
                .unwrap_or(0);
            let present: Vec<String> = raw
                .iter()
                .filter_map(|item| match item {
                    PlanItem::Step(s) => Some(s.agent.clone()),
                    PlanItem::Error { .. } => None,
                })
                .collect();

            let plan = normalize(raw, &MANDATORY);
            for agent in MANDATORY {
                let step = plan.step(agent).expect("mandatory step present");
                if !present.iter().any(|p| p == agent) {
                    assert!(step.order > original_max);
                }
            }
            assert!(plan.steps.windows(2).all(|w| w[0].order <= w[1].order));
            let appended: Vec<u32> = plan
                .steps
                .iter()
                .filter(|s| !present.contains(&s.agent))
                .map(|s| s.order)
                .collect();
            assert!(appended.windows(2).all(|w| w[0] < w[1]));
            assert!(plan.steps.iter().all(|s| s.order > 0));
        }
    }

    #[test]
    fn huge_orders_are_clamped_and_mandatory_steps_follow() {
        let plan = normalize(vec![step("CategoryAgent", Some(u32::MAX), &[])], &MANDATORY);
        assert_eq!(
            plan.agents(),
            vec!["CategoryAgent", "IntentAgent", "AppAgent", "RequestAgent"]
        );
        let orders: Vec<u32> = plan.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![MAX_ORDER, MAX_ORDER + 1, MAX_ORDER + 2, MAX_ORDER + 3]);
    }
}
