use serde_json::Value;

use crate::acl::handlers::{BOOLEAN, EXPRESSION};
use crate::acl::types::{Argument, RuleSpec};

/// One dispatch of the evaluation plan.
#[derive(Debug, Clone)]
pub struct EvaluationStep {
    pub handler: String,
    pub argument: Argument,
}

impl EvaluationStep {
    fn new(handler: &str, argument: Argument) -> Self {
        Self {
            handler: handler.to_string(),
            argument,
        }
    }
}

/// Flatten a rule into the ordered steps the evaluator runs.
///
/// Handler names are not checked here; an unknown one faults when dispatched.
pub fn normalize(rule: &RuleSpec) -> Vec<EvaluationStep> {
    let mut steps = Vec::new();
    push_steps(rule, &mut steps);
    steps
}

fn push_steps(rule: &RuleSpec, steps: &mut Vec<EvaluationStep>) {
    match rule {
        RuleSpec::Boolean(granted) => {
            steps.push(EvaluationStep::new(BOOLEAN, Value::Bool(*granted).into()));
        }
        RuleSpec::Null => steps.push(EvaluationStep::new(BOOLEAN, Value::Null.into())),
        RuleSpec::Expression(expression) => {
            steps.push(EvaluationStep::new(EXPRESSION, expression.clone().into()));
        }
        RuleSpec::Handlers(handlers) => {
            steps.extend(
                handlers
                    .iter()
                    .map(|(name, argument)| EvaluationStep::new(name, argument.clone())),
            );
        }
        RuleSpec::Chain(rules) => {
            for rule in rules {
                push_steps(rule, steps);
            }
        }
    }
}
