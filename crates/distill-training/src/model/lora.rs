//! Low-rank adapter planning.

use crate::config::{as_float, as_non_negative, get_any, truthy, RawConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::hyperparams::HyperParams;
use serde_json::Value;
use std::collections::BTreeSet;

/// Attention and projection leaf names adapters are attached to by default.
pub const KNOWN_TARGETS: &[&str] = &["q_proj", "k_proj", "v_proj", "o_proj", "c_attn", "c_proj"];

/// Conv1D-style layers that store weights transposed.
const FAN_IN_FAN_OUT_TARGETS: &[&str] = &["c_attn", "c_proj"];

#[derive(Debug, Clone, PartialEq)]
pub struct LoraConfig {
    pub enabled: bool,
    pub r: u64,
    pub alpha: f64,
    pub dropout: f64,
    /// `None` means infer from the model.
    pub target_modules: Option<Vec<String>>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self { enabled: true, r: 8, alpha: 16.0, dropout: 0.05, target_modules: None }
    }
}

impl LoraConfig {
    pub fn from_hyperparams(hp: &HyperParams) -> TrainingResult<Self> {
        match hp.section("lora") {
            Some(section) => Self::from_section(section),
            None => Ok(Self::default()),
        }
    }

    fn from_section(section: &RawConfig) -> TrainingResult<Self> {
        let defaults = Self::default();
        let r = get_any(section, &["r"]).map(|v| as_non_negative("r", v)).transpose()?.unwrap_or(defaults.r);
        if r == 0 {
            return Err(TrainingError::config("lora.r must be > 0"));
        }
        let dropout = get_any(section, &["dropout"])
            .map(|v| as_float("dropout", v))
            .transpose()?
            .unwrap_or(defaults.dropout);
        if !(0.0..1.0).contains(&dropout) {
            return Err(TrainingError::config("lora.dropout must be within [0, 1)"));
        }
        Ok(Self {
            enabled: get_any(section, &["enabled"]).is_none_or(truthy),
            r,
            alpha: get_any(section, &["alpha"])
                .map(|v| as_float("alpha", v))
                .transpose()?
                .unwrap_or(defaults.alpha),
            dropout,
            target_modules: get_any(section, &["target_modules", "targetModules"]).and_then(parse_targets),
        })
    }

    /// The adapter plan for a model with `module_names`, or `None` when LoRA is off
    /// or nothing matches.
    #[must_use]
    pub fn plan(&self, module_names: &[String]) -> Option<LoraPlan> {
        if !self.enabled {
            return None;
        }
        let targets = match &self.target_modules {
            Some(explicit) => explicit.clone(),
            None => infer_lora_targets(module_names),
        };
        if targets.is_empty() {
            return None;
        }
        let fan_in_fan_out = targets.iter().any(|t| FAN_IN_FAN_OUT_TARGETS.contains(&t.as_str()));
        Some(LoraPlan { r: self.r, alpha: self.alpha, dropout: self.dropout, target_modules: targets, fan_in_fan_out })
    }
}

/// Array of names or a comma-separated string.
fn parse_targets(value: &Value) -> Option<Vec<String>> {
    let names: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        Value::String(s) => s.split(',').map(|t| t.trim().to_string()).collect(),
        _ => return None,
    };
    let names: Vec<String> = names.into_iter().filter(|n| !n.is_empty()).collect();
    (!names.is_empty()).then_some(names)
}

/// Known leaf names present among `module_names`, sorted and de-duplicated.
#[must_use]
pub fn infer_lora_targets(module_names: &[String]) -> Vec<String> {
    module_names
        .iter()
        .filter_map(|name| name.rsplit('.').next())
        .filter(|leaf| KNOWN_TARGETS.contains(leaf))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoraPlan {
    pub r: u64,
    pub alpha: f64,
    pub dropout: f64,
    pub target_modules: Vec<String>,
    pub fan_in_fan_out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_infer_targets_from_leaves() {
        let modules = names(&[
            "model.layers.0.self_attn.v_proj",
            "model.layers.0.self_attn.q_proj",
            "model.layers.1.self_attn.q_proj",
            "model.layers.0.mlp.up_proj",
        ]);
        assert_eq!(infer_lora_targets(&modules), names(&["q_proj", "v_proj"]));
        assert!(infer_lora_targets(&names(&["embed", "lm_head"])).is_empty());
    }

    #[test]
    fn test_plan_for_gpt2_style_sets_fan_in_fan_out() {
        let plan = LoraConfig::default()
            .plan(&names(&["h.0.attn.c_attn", "h.0.attn.c_proj", "h.0.mlp.c_fc"]))
            .unwrap();
        assert_eq!(plan.target_modules, names(&["c_attn", "c_proj"]));
        assert!(plan.fan_in_fan_out);
        assert_eq!(plan.r, 8);
    }

    #[test]
    fn test_no_match_disables_silently() {
        assert!(LoraConfig::default().plan(&names(&["embed", "lm_head"])).is_none());
    }

    #[test]
    fn test_section_parsing() {
        let hp = HyperParams::new(
            json!({"lora": {"r": "4", "alpha": 8, "targetModules": "q_proj, k_proj", "enabled": true}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let cfg = LoraConfig::from_hyperparams(&hp).unwrap();
        assert_eq!(cfg.r, 4);
        assert_eq!(cfg.alpha, 8.0);
        assert_eq!(cfg.target_modules, Some(names(&["q_proj", "k_proj"])));

        let off = HyperParams::new(json!({"lora": {"enabled": false}}).as_object().cloned().unwrap());
        assert!(LoraConfig::from_hyperparams(&off).unwrap().plan(&names(&["q_proj"])).is_none());

        let bad = HyperParams::new(json!({"lora": {"r": 0}}).as_object().cloned().unwrap());
        assert!(LoraConfig::from_hyperparams(&bad).is_err());
    }
}
