//! Adam optimizer
//!
//! Bias-corrected Adam over every variable of a `VarMap`, using the
//! "epsilon hat" form `lr_t = lr * sqrt(1 - b2^t) / (1 - b1^t)`.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Optimizer;
use crate::error::{Error, Result};

const STEP_KEY: &str = "adam.step";
const LR_KEY: &str = "adam.learning_rate";

/// Adam hyper-parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Initial learning rate
    pub learning_rate: f64,

    /// Decay of the first moment
    pub beta1: f64,

    /// Decay of the second moment
    pub beta2: f64,

    /// Denominator offset
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
        }
    }
}

/// Adam optimizer
pub struct Adam {
    /// Variables being optimized
    var_map: VarMap,

    /// Hyper-parameters; `learning_rate` follows the schedule
    config: AdamConfig,

    /// Updates applied so far
    step_count: usize,

    /// First moment estimates by variable name
    first_moments: HashMap<String, Tensor>,

    /// Second moment estimates by variable name
    second_moments: HashMap<String, Tensor>,
}

impl Adam {
    /// Create an optimizer over the variables of `var_map`
    pub fn new(var_map: &VarMap, config: AdamConfig) -> Result<Self> {
        if !(0.0..1.0).contains(&config.beta1) || !(0.0..1.0).contains(&config.beta2) {
            return Err(Error::config(format!(
                "adam betas must lie in [0, 1), got {} and {}",
                config.beta1, config.beta2
            )));
        }
        Ok(Self {
            var_map: var_map.clone(),
            config,
            step_count: 0,
            first_moments: HashMap::new(),
            second_moments: HashMap::new(),
        })
    }

    /// Hyper-parameters
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Variables sorted by name
    fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|e| Error::internal(format!("var map lock poisoned: {}", e)))?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    fn update(&mut self, name: &str, var: &Var, grad: &Tensor, lr_t: f64) -> Result<()> {
        let AdamConfig {
            beta1,
            beta2,
            epsilon,
            ..
        } = self.config;
        let grad = grad.detach();

        let m = match self.first_moments.get(name) {
            Some(m) => ((m * beta1)? + (&grad * (1.0 - beta1))?)?,
            None => (&grad * (1.0 - beta1))?,
        };
        let v = match self.second_moments.get(name) {
            Some(v) => ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?,
            None => (grad.sqr()? * (1.0 - beta2))?,
        };

        let step = (m.div(&(v.sqrt()? + epsilon)?)? * lr_t)?;
        let updated = var.as_tensor().detach().sub(&step)?;
        var.set(&updated)?;

        self.first_moments.insert(name.to_string(), m);
        self.second_moments.insert(name.to_string(), v);
        Ok(())
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;
        let t = self.step_count as i32;
        let lr_t = self.config.learning_rate * (1.0 - self.config.beta2.powi(t)).sqrt()
            / (1.0 - self.config.beta1.powi(t));

        let mut updated = 0;
        for (name, var) in self.named_vars()? {
            if let Some(grad) = gradients.get(&var) {
                self.update(&name, &var, grad, lr_t)?;
                updated += 1;
            }
        }
        debug!("adam step {}: updated {} variables", self.step_count, updated);
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for (name, m) in &self.first_moments {
            state.insert(format!("m/{}", name), m.clone());
        }
        for (name, v) in &self.second_moments {
            state.insert(format!("v/{}", name), v.clone());
        }
        state.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step_count as f64], &Device::Cpu)?,
        );
        state.insert(
            LR_KEY.to_string(),
            Tensor::new(&[self.config.learning_rate], &Device::Cpu)?,
        );
        Ok(state)
    }

    fn load_state_tensors(&mut self, state: HashMap<String, Tensor>) -> Result<()> {
        let scalar = |key: &str| -> Result<f64> {
            let tensor = state
                .get(key)
                .ok_or_else(|| Error::checkpoint(format!("optimizer state misses {}", key)))?;
            tensor
                .flatten_all()?
                .to_vec1::<f64>()?
                .first()
                .copied()
                .ok_or_else(|| Error::checkpoint(format!("optimizer state {} is empty", key)))
        };
        let step_count = scalar(STEP_KEY)? as usize;
        let learning_rate = scalar(LR_KEY)?;

        let mut first_moments = HashMap::new();
        let mut second_moments = HashMap::new();
        for (key, tensor) in &state {
            if let Some(name) = key.strip_prefix("m/") {
                first_moments.insert(name.to_string(), tensor.clone());
            } else if let Some(name) = key.strip_prefix("v/") {
                second_moments.insert(name.to_string(), tensor.clone());
            }
        }
        if first_moments.len() != second_moments.len() {
            return Err(Error::checkpoint(format!(
                "optimizer state has {} first and {} second moments",
                first_moments.len(),
                second_moments.len()
            )));
        }

        self.step_count = step_count;
        self.config.learning_rate = learning_rate;
        self.first_moments = first_moments;
        self.second_moments = second_moments;
        Ok(())
    }
}
