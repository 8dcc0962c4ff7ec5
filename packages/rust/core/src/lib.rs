//! Research pipeline for Dossier.
//!
//! This crate turns a `(subject, target)` pair into a checkpointed session of
//! per-domain tables: domain registry, research strategies, synthesis with
//! validation-driven retries, output parsing and the orchestrating loop.

pub mod domains;
pub mod llm;
pub mod orchestrator;
pub mod parser;
pub mod research;
pub mod session;
pub mod synthesis;
pub mod validator;

pub use domains::{DomainConfig, DomainRegistry, RunEstimate, TableSchema};
pub use llm::OpenRouterClient;
pub use orchestrator::{Orchestrator, ProgressReporter, SilentProgress};
pub use parser::{ParseResult, ParsedPayload, parse};
pub use research::{
    DomainResearch, DomainTask, GatherAndSynthesize, IntegratedResearch, ResearchStrategy,
    WebResearch, WebResearcher,
};
pub use session::{SessionManager, SessionSummary};
pub use synthesis::{Generation, Generator, SynthesisMetrics, SynthesisOptions, synthesize};
pub use validator::{OutputValidator, ValidationReport};
