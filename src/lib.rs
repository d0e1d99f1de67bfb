//! # Casefile
//!
//! Incremental mail ingestion, casefile scoping, and cited retrieval over
//! an email archive.
//!
//! Metadata for the whole mailbox is ingested cheaply; bodies are fetched,
//! cleaned, chunked, and embedded only for messages a user has placed in a
//! casefile. Questions are answered from exactly one casefile, with every
//! retrieved chunk traceable to its source message.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌──────────┐   ┌──────────┐
//! │  Mailbox  │──▶│  Ingest   │──▶│ Clusters │──▶│ Casefile │
//! │  (Gmail)  │   │ metadata  │   │  (view)  │   │ (scoped) │
//! └───────────┘   └───────────┘   └──────────┘   └────┬─────┘
//!                                                     │
//!        ┌────────────────────────────────────────────┘
//!        ▼
//! ┌──────────────┐   ┌──────────┐   ┌──────────────────┐
//! │ Enrich       │──▶│  Embed   │──▶│ Ask (cited, one  │
//! │ body→chunks  │   │ indexer  │   │ casefile only)   │
//! └──────────────┘   └──────────┘   └──────────────────┘
//! ```
//!
//! Every message carries a `processing_state`
//! (`discovered → metadata_synced → body_fetched → chunked → embedded`);
//! stage workers advance it with conditional updates, so any number of them
//! may run against the same database and every run is safe to repeat.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and the processing state |
//! | [`error`] | Typed errors for providers, casefiles, and retrieval |
//! | [`store`] | Message store, state machine, chunk persistence |
//! | [`mail`] | Mail provider trait |
//! | [`connector_gmail`] | Gmail REST adapter |
//! | [`retry`] | Bounded exponential backoff |
//! | [`ingest`] | Ingestion worker and checkpoints |
//! | [`cluster`] | Clustering by sender domain and thread |
//! | [`casefile`] | Casefile creation and expansion |
//! | [`extract`] | Body decoding, quote and signature stripping |
//! | [`chunk`] | Chunking strategies |
//! | [`enrich`] | Enrichment worker |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Casefile-scoped vector storage |
//! | [`embed_cmd`] | Embedding indexer and coverage |
//! | [`answer`] | Answer generator |
//! | [`retrieve`] | Retrieval and answer assembly |
//! | [`status`] | Pipeline and casefile status |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod casefile;
pub mod chunk;
pub mod cluster;
pub mod config;
pub mod connector_gmail;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod mail;
pub mod migrate;
pub mod models;
pub mod retrieve;
pub mod retry;
pub mod server;
pub mod status;
pub mod store;
pub mod vector_store;
