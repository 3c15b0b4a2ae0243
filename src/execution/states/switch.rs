use log::debug;
use serde_json::Value;

use super::{Route, StepOutcome};
use crate::error::StateError;
use crate::expression::{is_truthy, ExpressionEvaluator};
use crate::workflow::model::SwitchState;

/// Routes on the first truthy data condition, in declared order. The input
/// passes through unchanged.
pub(super) fn execute(
    evaluator: &dyn ExpressionEvaluator,
    switch: &SwitchState,
    input: Value,
) -> Result<StepOutcome, StateError> {
    for condition in &switch.data_conditions {
        let verdict = evaluator.evaluate(&condition.condition, &input)?;
        if is_truthy(&verdict) {
            debug!(
                "Condition '{}' matched",
                condition.name.as_deref().unwrap_or(&condition.condition)
            );
            return Ok(StepOutcome {
                output: Some(input),
                route: route(condition.transition.as_deref(), condition.end),
            });
        }
    }

    let default = switch
        .default_condition
        .as_ref()
        .ok_or(StateError::NoMatchingCondition)?;

    debug!("No condition matched, taking the default");
    Ok(StepOutcome {
        output: Some(input),
        route: route(default.transition.as_deref(), default.end),
    })
}

fn route(transition: Option<&str>, end: bool) -> Route {
    match transition {
        Some(target) => Route::To(target.to_string()),
        None if end => Route::End,
        None => Route::Declared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::JqEvaluator;
    use crate::workflow::model::{DataCondition, DefaultCondition};
    use serde_json::json;

    fn switch(default: Option<DefaultCondition>) -> SwitchState {
        SwitchState {
            data_conditions: vec![
                DataCondition::new("${ .amount > 100 }", "Large"),
                DataCondition::new("${ .amount > 10 }", "Medium"),
                DataCondition {
                    name: Some("zero".to_string()),
                    condition: "${ .amount == 0 }".to_string(),
                    transition: None,
                    end: true,
                },
            ],
            default_condition: default,
        }
    }

    fn to(target: &str) -> Option<DefaultCondition> {
        Some(DefaultCondition {
            transition: Some(target.to_string()),
            end: false,
        })
    }

    #[test]
    fn test_first_match_wins() {
        let outcome = execute(&JqEvaluator, &switch(None), json!({"amount": 500})).unwrap();
        assert_eq!(outcome.route, Route::To("Large".to_string()));

        let outcome = execute(&JqEvaluator, &switch(None), json!({"amount": 50})).unwrap();
        assert_eq!(outcome.route, Route::To("Medium".to_string()));
    }

    #[test]
    fn test_condition_may_end_the_run() {
        let outcome = execute(&JqEvaluator, &switch(None), json!({"amount": 0})).unwrap();
        assert_eq!(outcome.route, Route::End);
    }

    #[test]
    fn test_default_when_nothing_matches() {
        let outcome = execute(&JqEvaluator, &switch(to("Small")), json!({"amount": 5})).unwrap();
        assert_eq!(outcome.route, Route::To("Small".to_string()));
    }

    #[test]
    fn test_no_match_without_default() {
        let err = execute(&JqEvaluator, &switch(None), json!({"amount": 5})).unwrap_err();
        assert!(matches!(err, StateError::NoMatchingCondition));
    }

    #[test]
    fn test_input_passes_through() {
        let input = json!({"amount": 500, "customer": "c-1"});
        let outcome = execute(&JqEvaluator, &switch(None), input.clone()).unwrap();
        assert_eq!(outcome.output, Some(input));
    }

    #[test]
    fn test_null_and_false_are_falsy() {
        let switch = SwitchState {
            data_conditions: vec![
                DataCondition::new(".missing", "A"),
                DataCondition::new(".flag", "B"),
                DataCondition::new(".zero", "C"),
            ],
            default_condition: None,
        };

        let outcome = execute(&JqEvaluator, &switch, json!({"flag": false, "zero": 0})).unwrap();
        assert_eq!(outcome.route, Route::To("C".to_string()));
    }

    #[test]
    fn test_bad_condition_is_an_expression_error() {
        let switch = SwitchState {
            data_conditions: vec![DataCondition::new(".a[", "A")],
            default_condition: to("B"),
        };

        let err = execute(&JqEvaluator, &switch, json!({})).unwrap_err();
        assert!(matches!(err, StateError::Expression(_)));
    }
}
