//! # Sampling loop
//!
//! The sampler walks a strictly decreasing list of cosine t values and
//! advances the noisy state one step at a time. Sampling is lazy: the loop
//! is an iterator yielding a [`StepOutput`] per step so that callers can save
//! progress images, and nothing is kept once a step has been yielded.
use crate::error::{Error, Result};
use crate::guidance::CondFn;
use crate::models::DiffusionModel;
use crate::schedulers::ddim::ddim_step;
use crate::schedulers::pndm::{prk_step, Plms};
use crate::schedulers::GuidedModel;
use crate::utils::{all_finite, Prng, PrngKey};
use tch::Tensor;

/// The integration rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleMode {
    /// One evaluation per step, `eta` controls the amount of fresh noise.
    Ddim { eta: f64 },
    /// Four evaluations per step.
    Prk,
    /// One evaluation per step after three warm-up PRK steps.
    Plms,
}

impl SampleMode {
    pub fn from_name(name: &str, eta: f64) -> Result<Self> {
        match name {
            "ddim" => Ok(Self::Ddim { eta }),
            "prk" => Ok(Self::Prk),
            "plms" => Ok(Self::Plms),
            _ => Err(Error::invalid("sample_mode", format!("unknown sampler {name:?}"))),
        }
    }
}

/// The record produced by each sampler step.
#[derive(Debug)]
pub struct StepOutput {
    /// The index of the step, starting at 0.
    pub step: usize,
    /// The clean image prediction made during the step.
    pub pred: Tensor,
    /// The state after the step, a copy owned by the caller.
    pub x: Tensor,
}

pub struct Sampler<'a> {
    model: &'a dyn DiffusionModel,
    cond_fn: &'a CondFn,
    ts: Vec<f64>,
    mode: SampleMode,
}

impl<'a> Sampler<'a> {
    /// Creates a sampler going through the cosine t values `ts`, this
    /// results in `ts.len() - 1` steps.
    pub fn new(
        model: &'a dyn DiffusionModel,
        cond_fn: &'a CondFn,
        ts: Vec<f64>,
        mode: SampleMode,
    ) -> Self {
        Self { model, cond_fn, ts, mode }
    }

    pub fn steps(&self) -> usize {
        self.ts.len().saturating_sub(1)
    }

    /// Starts sampling from the state `x`.
    pub fn sample(&self, x: Tensor, key: PrngKey) -> SampleLoop<'_, 'a> {
        SampleLoop {
            sampler: self,
            x,
            rng: Prng::new(key),
            step: 0,
            plms: Plms::new(),
            last_good_step: None,
            done: false,
        }
    }
}

/// The iterator over the sampler steps. It stops after the last step or
/// after the first error.
pub struct SampleLoop<'s, 'a> {
    sampler: &'s Sampler<'a>,
    x: Tensor,
    rng: Prng,
    step: usize,
    plms: Plms,
    last_good_step: Option<usize>,
    done: bool,
}

impl SampleLoop<'_, '_> {
    fn advance(&mut self) -> Result<StepOutput> {
        let step = self.step;
        let (t1, t2) = (self.sampler.ts[step], self.sampler.ts[step + 1]);
        let key = self.rng.split();
        let model = GuidedModel::new(self.sampler.model, self.sampler.cond_fn);
        let (x, pred) = match self.sampler.mode {
            SampleMode::Ddim { eta } => {
                let (eval_key, noise_key) = key.split();
                let guided = model.eval(&self.x, t1, eval_key)?;
                (ddim_step(&self.x, &guided, t1, t2, eta, noise_key), guided.pred)
            }
            SampleMode::Prk => {
                let out = prk_step(&model, &self.x, t1, t2, key)?;
                (out.x, out.pred)
            }
            SampleMode::Plms => {
                let out = self.plms.step(&model, &self.x, t1, t2, key)?;
                (out.x, out.pred)
            }
        };
        if !all_finite(&x) {
            return Err(Error::NonFinite { step, last_good_step: self.last_good_step });
        }
        tracing::debug!(step, t = t1, "sampler step");
        self.last_good_step = Some(step);
        self.step += 1;
        let out = StepOutput { step, pred, x: x.copy() };
        self.x = x;
        Ok(out)
    }
}

impl Iterator for SampleLoop<'_, '_> {
    type Item = Result<StepOutput>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.step >= self.sampler.steps() {
            return None;
        }
        let out = tch::no_grad(|| self.advance());
        if out.is_err() {
            self.done = true;
        }
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.done { 0 } else { self.sampler.steps() - self.step };
        (0, Some(remaining))
    }
}
