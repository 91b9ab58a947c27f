//! Built-in filters: a synthetic source, payload-moving transforms and an
//! inspectable sink. Enough to exercise every shape and to seed a control
//! plane's filter registry.

mod sink;
mod source;
mod transform;

use serde::Deserialize;
use serde_json::Value;
pub use sink::{FrameSink, SinkHandle, SinkRecord};
pub use source::{FrameSource, SourceStats};
pub use transform::{Merger, PassThrough, Splitter};

use cascade_timing::Duration;

use crate::{
    control::FilterRegistry,
    error::ControlError,
    filter::Filter,
    frame::StreamSpec,
};

#[derive(Deserialize)]
struct SourceParams {
    #[serde(default)]
    spec: StreamSpec,
    interval_us: u64,
    limit: Option<u64>,
}

#[derive(Deserialize)]
struct TransformParams {
    #[serde(default)]
    spec: StreamSpec,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct SinkParams {
    poll_us: Option<u64>,
}

fn params<T: serde::de::DeserializeOwned>(
    command: &'static str,
    value: &Value,
) -> Result<T, ControlError> {
    serde_json::from_value(value.clone())
        .map_err(|e| ControlError::BadParams { command, reason: e.to_string() })
}

/// Registers the built-in filter types under their control-plane tags.
pub fn register_builtins(registry: &mut FilterRegistry) {
    registry.register("frameSource", |v| {
        let p: SourceParams = params("addFilter/frameSource", v)?;
        let mut source = FrameSource::new(p.spec, Duration::from_micros(p.interval_us));
        if let Some(limit) = p.limit {
            source = source.with_limit(limit);
        }
        Ok(Filter::head(source))
    });
    registry.register("passThrough", |v| {
        let p: TransformParams = params("addFilter/passThrough", v)?;
        Ok(Filter::one_to_one(PassThrough::new(p.spec)))
    });
    registry.register("splitter", |v| {
        let p: TransformParams = params("addFilter/splitter", v)?;
        Ok(Filter::one_to_many(Splitter::new(p.spec)))
    });
    registry.register("merger", |v| {
        let p: TransformParams = params("addFilter/merger", v)?;
        Ok(Filter::many_to_one(Merger::new(p.spec)).with_force(p.force))
    });
    registry.register("frameSink", |v| {
        let p: SinkParams = params("addFilter/frameSink", v)?;
        let mut sink = FrameSink::new();
        if let Some(poll) = p.poll_us {
            sink = sink.with_poll(Duration::from_micros(poll));
        }
        Ok(Filter::tail(sink))
    });
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::filter::FilterKind;

    #[test]
    fn builtins_build_from_params() {
        let mut registry = FilterRegistry::new();
        register_builtins(&mut registry);

        let f = registry
            .build("frameSource", &json!({"interval_us": 10_000, "limit": 100}))
            .expect("source");
        assert_eq!(f.kind(), FilterKind::Head);

        let f = registry.build("frameSink", &json!({})).expect("sink");
        assert_eq!(f.kind(), FilterKind::Tail);

        let f = registry.build("merger", &json!({"force": true})).expect("merger");
        assert_eq!(f.kind(), FilterKind::ManyToOne);
        assert!(f.force());
    }

    #[test]
    fn bad_params_are_reported() {
        let mut registry = FilterRegistry::new();
        register_builtins(&mut registry);
        let err = registry.build("frameSource", &json!({})).unwrap_err();
        assert!(matches!(err, ControlError::BadParams { .. }));
    }
}
