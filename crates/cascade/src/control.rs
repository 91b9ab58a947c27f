use std::collections::HashMap;

use cascade_timing::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    FilterId, PathId, PortId,
    error::ControlError,
    event::Event,
    filter::Filter,
    pipeline::PipelineManager,
};

/// Control-plane requests the core accepts. The wire encoding lives
/// outside; whatever transport is in front deserializes into this.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    AddFilter {
        #[serde(rename = "type")]
        filter_type: String,
        id: Option<FilterId>,
        #[serde(default)]
        params: Value,
    },
    RemoveFilter {
        id: FilterId,
    },
    CreatePath {
        id: PathId,
        origin: FilterId,
        destination: FilterId,
        origin_writer: PortId,
        dest_reader: PortId,
        #[serde(default)]
        intermediates: Vec<FilterId>,
    },
    ConnectPath {
        id: PathId,
    },
    DisconnectPath {
        id: PathId,
    },
    StartWorkers,
    StopWorkers,
    FilterEvent {
        id: FilterId,
        name: String,
        #[serde(default)]
        params: Value,
        /// Delivery delay in microseconds from now; absent means next cycle.
        delay: Option<u64>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::AddFilter { .. } => "addFilter",
            Command::RemoveFilter { .. } => "removeFilter",
            Command::CreatePath { .. } => "createPath",
            Command::ConnectPath { .. } => "connectPath",
            Command::DisconnectPath { .. } => "disconnectPath",
            Command::StartWorkers => "startWorkers",
            Command::StopWorkers => "stopWorkers",
            Command::FilterEvent { .. } => "filterEvent",
        }
    }
}

/// Successful dispatch outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Reply {
    Done,
    FilterAdded { id: FilterId },
}

type Constructor = Box<dyn Fn(&Value) -> Result<Filter, ControlError> + Send + Sync>;

/// Maps filter-type tags to constructors so `addFilter` can build filters
/// from opaque parameters.
#[derive(Default)]
pub struct FilterRegistry {
    constructors: HashMap<String, Constructor>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, filter_type: impl Into<String>, constructor: F)
    where
        F: Fn(&Value) -> Result<Filter, ControlError> + Send + Sync + 'static,
    {
        self.constructors.insert(filter_type.into(), Box::new(constructor));
    }

    pub fn build(&self, filter_type: &str, params: &Value) -> Result<Filter, ControlError> {
        let ctor = self
            .constructors
            .get(filter_type)
            .ok_or_else(|| ControlError::UnknownFilterType(filter_type.to_owned()))?;
        ctor(params)
    }

    pub fn known_types(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry").field("types", &self.known_types()).finish()
    }
}

/// Translates one deserialized command into manager calls or events. Errors
/// leave the graph unchanged except where a partial rollback is already the
/// operation's own contract.
pub fn dispatch(
    manager: &PipelineManager,
    registry: &FilterRegistry,
    command: Command,
) -> Result<Reply, ControlError> {
    debug!(command = command.name(), "control dispatch");
    match command {
        Command::AddFilter { filter_type, id, params } => {
            let filter = registry.build(&filter_type, &params)?;
            let id = id.unwrap_or_else(PipelineManager::reserve_filter_id);
            manager.add_filter(id, filter)?;
            Ok(Reply::FilterAdded { id })
        }
        Command::RemoveFilter { id } => {
            manager.remove_filter(id)?;
            Ok(Reply::Done)
        }
        Command::CreatePath { id, origin, destination, origin_writer, dest_reader, intermediates } => {
            manager.create_path(id, origin, destination, origin_writer, dest_reader, intermediates)?;
            Ok(Reply::Done)
        }
        Command::ConnectPath { id } => {
            manager.connect_path(id)?;
            Ok(Reply::Done)
        }
        Command::DisconnectPath { id } => {
            manager.disconnect_path(id)?;
            Ok(Reply::Done)
        }
        Command::StartWorkers => {
            manager.start_workers();
            Ok(Reply::Done)
        }
        Command::StopWorkers => {
            manager.stop_workers();
            Ok(Reply::Done)
        }
        Command::FilterEvent { id, name, params, delay } => {
            let filter = manager
                .get_filter(id)
                .ok_or(crate::error::PipelineError::UnknownFilter(id))?;
            let mut event = Event::new(name, params);
            if let Some(us) = delay {
                event = event.after(Duration::from_micros(us));
            }
            filter.push_event(event);
            Ok(Reply::Done)
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn commands_deserialize_from_tagged_json() {
        let cmd: Command = serde_json::from_value(json!({
            "command": "createPath",
            "id": 5004,
            "origin": 1,
            "destination": 2,
            "originWriter": 5004,
            "destReader": 5004,
        }))
        .expect("createPath");
        assert!(matches!(cmd, Command::CreatePath { id: 5004, intermediates, .. } if intermediates.is_empty()));

        let cmd: Command = serde_json::from_value(json!({
            "command": "filterEvent",
            "id": 7,
            "name": "setBitrate",
            "params": {"kbps": 512},
        }))
        .expect("filterEvent");
        assert!(matches!(cmd, Command::FilterEvent { id: 7, delay: None, .. }));
    }

    #[test]
    fn unknown_filter_type_is_refused() {
        let manager = PipelineManager::new(RuntimeConfig::default());
        let registry = FilterRegistry::new();
        let err = dispatch(
            &manager,
            &registry,
            Command::AddFilter { filter_type: "noSuch".into(), id: None, params: Value::Null },
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::UnknownFilterType(t) if t == "noSuch"));
    }

    #[test]
    fn filter_event_to_unknown_filter_fails_softly() {
        let manager = PipelineManager::new(RuntimeConfig::default());
        let registry = FilterRegistry::new();
        let err = dispatch(
            &manager,
            &registry,
            Command::FilterEvent { id: 99, name: "x".into(), params: Value::Null, delay: None },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ControlError::Pipeline(crate::error::PipelineError::UnknownFilter(99))
        ));
    }
}
