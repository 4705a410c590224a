//! Rule-driven routing steps.
//!
//! Both evaluate JEXL against each item (`item`, `tags`, `index`) and route
//! it to one or more output ports. Every declared output port is present in
//! the result, possibly empty, so downstream steps on an unused branch see
//! an empty sequence and get skipped.

use serde::Deserialize;
use serde_json::Value;
use switchyard_types::error::StepError;
use switchyard_types::item::{Item, MAIN_PORT, ParamBag, PortBundle};

use super::{param_bool, param_str, require_str};
use crate::expression::{ExpressionEvaluator, item_context};
use crate::step::{ExecutionContext, StepDescriptor, StepHandler};

fn rule_error(expression: &str, err: impl std::fmt::Display) -> StepError {
    StepError::validation(format!("rule '{expression}' failed: {err}"))
}

// ---------------------------------------------------------------------------
// if
// ---------------------------------------------------------------------------

/// Routes items to `true` or `false` by the `condition` parameter.
pub struct IfStep {
    descriptor: StepDescriptor,
}

impl IfStep {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor {
                outputs: vec!["true".to_string(), "false".to_string()],
                ..StepDescriptor::simple("if", "If")
            },
        }
    }

    fn split(condition: &str, items: Vec<Item>) -> Result<(Vec<Item>, Vec<Item>), StepError> {
        let evaluator = ExpressionEvaluator::new();
        let mut matched = Vec::new();
        let mut rest = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            let ctx = item_context(&item, index);
            if evaluator
                .evaluate_bool(condition, &ctx)
                .map_err(|e| rule_error(condition, e))?
            {
                matched.push(item);
            } else {
                rest.push(item);
            }
        }
        Ok((matched, rest))
    }
}

impl Default for IfStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandler for IfStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        params: &ParamBag,
        _ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let condition = require_str(params, "condition")?;
        let (matched, rest) = Self::split(condition, inputs.take(MAIN_PORT))?;

        let mut out = PortBundle::new();
        out.insert("true", matched);
        out.insert("false", rest);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// switch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct Rule {
    output: String,
    condition: String,
}

fn parse_rules(params: &ParamBag) -> Result<Vec<Rule>, StepError> {
    match params.get("rules") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| StepError::validation(format!("invalid 'rules' parameter: {e}"))),
    }
}

/// Routes items by an ordered list of `rules` (`{output, condition}`).
///
/// The output port set is computed from the rules plus the optional
/// `fallback` port. Items matching nothing go to `fallback`, or are dropped
/// without one. With `all_matches` an item is copied to every matching
/// rule's port instead of only the first.
pub struct SwitchStep {
    descriptor: StepDescriptor,
}

impl SwitchStep {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor {
                outputs: Vec::new(),
                ..StepDescriptor::simple("switch", "Switch")
            },
        }
    }

    fn route(
        rules: &[Rule],
        fallback: Option<&str>,
        all_matches: bool,
        items: Vec<Item>,
        out: &mut PortBundle,
    ) -> Result<(), StepError> {
        let evaluator = ExpressionEvaluator::new();
        for (index, item) in items.into_iter().enumerate() {
            let ctx = item_context(&item, index);
            let mut hit = false;
            for rule in rules {
                let matched = evaluator
                    .evaluate_bool(&rule.condition, &ctx)
                    .map_err(|e| rule_error(&rule.condition, e))?;
                if matched {
                    out.extend_port(rule.output.clone(), [item.clone()]);
                    hit = true;
                    if !all_matches {
                        break;
                    }
                }
            }
            if !hit {
                if let Some(port) = fallback {
                    out.extend_port(port, [item]);
                }
            }
        }
        Ok(())
    }
}

impl Default for SwitchStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandler for SwitchStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn output_ports(&self, params: &ParamBag) -> Vec<String> {
        let mut ports: Vec<String> = Vec::new();
        let rules = parse_rules(params).unwrap_or_default();
        let fallback = param_str(params, "fallback").ok().flatten();
        for name in rules.iter().map(|r| r.output.as_str()).chain(fallback) {
            if !ports.iter().any(|p| p == name) {
                ports.push(name.to_string());
            }
        }
        ports
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        params: &ParamBag,
        _ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let rules = parse_rules(params)?;
        if rules.is_empty() {
            return Err(StepError::validation("switch requires at least one rule"));
        }
        let fallback = param_str(params, "fallback")?;
        let all_matches = param_bool(params, "all_matches", false)?;

        let mut out = PortBundle::new();
        for port in StepHandler::output_ports(self, params) {
            out.insert(port, Vec::new());
        }
        Self::route(&rules, fallback, all_matches, inputs.take(MAIN_PORT), &mut out)?;
        Ok(out)
    }
}
