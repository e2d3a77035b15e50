//! # Template Harness
//!
//! Retrieval-augmented generation and validation of Nuclei vulnerability
//! templates.
//!
//! A corpus of existing YAML templates is chunked, embedded and stored in
//! a vector index. A natural-language request is answered by retrieving
//! similar templates, asking an LLM for a new one, and checking the result
//! with the scanner's own validator, refining until it passes or the retry
//! budget runs out.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Loader    │──▶│ VectorStore  │──▶│ VectorIndex │
//! │ YAML files │   │ chunk+embed  │   │ mem/sqlite  │
//! └────────────┘   └──────┬───────┘   └─────────────┘
//!                         │
//!                  ┌──────▼───────┐
//!                  │  Retrieval   │
//!                  └──────┬───────┘
//!                         ▼
//!            ┌────────────────────────┐     ┌───────────┐
//!            │      Orchestrator      │────▶│ Validator │
//!            │ generate/check/refine  │◀────│ (nuclei)  │
//!            └────────────┬───────────┘     └───────────┘
//!                         ▼
//!                    ┌─────────┐
//!                    │   LLM   │
//!                    └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tmpl init                          # create the collection
//! tmpl reload ./nuclei-templates     # ingest a template checkout
//! tmpl search "exposed git config"
//! tmpl generate "SQL injection in the login form" --severity high
//! tmpl validate ./generated.yaml
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error taxonomy |
//! | [`models`] | Core data types |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index backends |
//! | [`store`] | Vector store lifecycle, add and search |
//! | [`loader`] | Template discovery and parsing |
//! | [`ingest`] | Bulk ingestion and reload |
//! | [`retrieval`] | Filtered retrieval and context formatting |
//! | [`validator`] | External validator process runner |
//! | [`llm`] | Text-generation providers |
//! | [`extract`] | Payload extraction from LLM output |
//! | [`prompts`] | Prompt templates |
//! | [`orchestrator`] | Generate/validate/refine loop |
//! | [`status`] | Health overview |
//! | [`logging`] | `tracing` subscriber setup |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod prompts;
pub mod retrieval;
pub mod status;
pub mod store;
pub mod validator;
