//! Strategy wrapper that confirms technical signals with a model prediction.
//!
//! `EnhancedStrategy<S, P>` wraps any `Strategy` and consults a `Predictor`
//! for every actionable signal:
//!
//! - model disagrees with confidence at or above `veto_confidence` → `Hold`
//! - otherwise confidence becomes the weighted blend of the technical
//!   confidence and the model's support for the signal direction (its
//!   confidence when agreeing, the complement when disagreeing)
//! - a model `Hold` or a failed prediction leaves the signal unchanged

use anyhow::Result;
use async_trait::async_trait;
use fx_engine_core::config::BlendConfig;
use fx_engine_core::events::{Bar, Prediction, Signal, SignalDirection};
use fx_engine_core::traits::{Predictor, Strategy};
use tracing::{debug, warn};

pub struct EnhancedStrategy<S: Strategy, P: Predictor> {
    inner: S,
    predictor: P,
    blend: BlendConfig,
    name: String,
}

impl<S: Strategy, P: Predictor> EnhancedStrategy<S, P> {
    #[must_use]
    pub fn new(strategy: S, predictor: P, blend: BlendConfig) -> Self {
        let name = format!("{} + model", strategy.name());
        Self {
            inner: strategy,
            predictor,
            blend,
            name,
        }
    }

    /// Returns a reference to the inner strategy.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn apply(&self, signal: Signal, prediction: Prediction) -> Signal {
        let technical = signal.direction;
        let model_conf = prediction.confidence.clamp(0.0, 1.0);

        let support = match prediction.direction {
            SignalDirection::Hold => return signal,
            d if d == technical => model_conf,
            _ if model_conf >= self.blend.veto_confidence => {
                return Signal::hold(
                    signal.instrument.clone(),
                    signal.reference_price,
                    format!(
                        "model veto: {:?} at {model_conf:.2} against {technical:?}",
                        prediction.direction
                    ),
                );
            }
            _ => 1.0 - model_conf,
        };

        let total = self.blend.technical_weight + self.blend.model_weight;
        let blended = if total > 0.0 {
            (self.blend.technical_weight * signal.confidence + self.blend.model_weight * support) / total
        } else {
            signal.confidence
        };

        Signal {
            confidence: blended.clamp(0.0, 1.0),
            reason: format!("{} | model {:?} {model_conf:.2}", signal.reason, prediction.direction),
            ..signal
        }
    }
}

#[async_trait]
impl<S: Strategy, P: Predictor> Strategy for EnhancedStrategy<S, P> {
    async fn analyze(&self, instrument: &str, bars: &[Bar]) -> Result<Signal> {
        let signal = self.inner.analyze(instrument, bars).await?;
        if signal.is_hold() {
            return Ok(signal);
        }

        match self.predictor.predict(instrument, bars).await {
            Ok(prediction) => {
                let enhanced = self.apply(signal, prediction);
                debug!(
                    instrument,
                    direction = ?enhanced.direction,
                    confidence = enhanced.confidence,
                    "Model blended signal"
                );
                Ok(enhanced)
            }
            Err(e) => {
                warn!(instrument, error = %e, "Prediction failed, using technical signal");
                Ok(signal)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
