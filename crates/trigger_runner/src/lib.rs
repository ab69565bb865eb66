pub mod burst;
pub mod config_loader;
pub mod orchestrator;

pub use burst::NullBurstSink;
pub use config_loader::{load_trigger_config, AlarmSettings, Profile, Profiles, TriggerConfig};
pub use orchestrator::{
    describe_metrics, ActiveRun, Collaborators, Orchestrator, RecordDisposition, RunSummary,
};
