//! Core pipeline types shared between the engine, the server, and every
//! adapter implementation: the wire reply/domain types, the envelope
//! `Meta` map, the `Adapter` contract, the phase enum, and the closed
//! registry of adapter kinds.

pub mod adapter;
pub mod meta;
pub mod opts;
pub mod phase;
pub mod registry;
pub mod wire;

pub use adapter::{
    default_halt_reply, Adapter, HaltReason, PhaseOutcome, RateLimitScope, SessionCtx,
    StageState, TerminationReason,
};
pub use meta::Meta;
pub use phase::Phase;
pub use registry::{
    AdapterKind, AdapterOpts, CompiledPipeline, CompiledStage, InitFn, PipelineSpec, Registry,
    RegistryError,
};
pub use wire::{ClientName, Credentials, Domain, Reply, ReplyCode, ReplyParseError, TlsMode};
