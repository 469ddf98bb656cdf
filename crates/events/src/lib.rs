//! CDEvents lifecycle events and the asynchronous sink emitter.

#![forbid(unsafe_code)]

mod emitter;
mod event;
mod id;

pub use emitter::{
    spawn_emitter, EmitterConfig, EmitterCounters, EmitterTask, EventEmitter, HttpPoster, ReqwestPoster,
};
pub use event::{
    CdEvent, Environment, EventFactory, Subject, SubjectContent, TYPE_ENV_CREATED, TYPE_ENV_MODIFIED,
    TYPE_SERVICE_DEPLOYED, TYPE_SERVICE_REMOVED, TYPE_SERVICE_UPGRADED,
};
pub use id::IdGenerator;
