//! # Insight Server
//!
//! A vault-synchronized semantic index and retrieval server for personal
//! notes.
//!
//! The server watches the `Insights/` folder of a markdown vault, keeps a
//! vector index (Chroma) synchronized with it, and answers semantic
//! retrieval queries for Question notes — plus an optional step that asks
//! a chat model to generate reflective comparison questions from the
//! retrieved Insights.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────┐
//! │ Vault (fs)   │──▶│ Watcher +      │──▶│  Chroma   │
//! │ Insights/*.md│   │ debounce/sync  │   │ (cosine)  │
//! └──────────────┘   └────────────────┘   └────┬─────┘
//!                                              │
//!                          ┌───────────────────┤
//!                          ▼                   ▼
//!                     ┌──────────┐       ┌──────────┐
//!                     │   CLI    │       │   HTTP   │
//!                     │(insightd)│       │ /api/v1  │
//!                     └──────────┘       └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Store error taxonomy |
//! | [`note`] | Frontmatter parsing, normalization, Insight classification |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector`] | Vector index abstraction (Chroma + in-memory) |
//! | [`store`] | Document identity and upsert/delete/query |
//! | [`watcher`] | Debounced filesystem watcher |
//! | [`sync`] | Mutation application and bulk reindex |
//! | [`questions`] | Comparison question generation |
//! | [`server`] | JSON HTTP API |

pub mod config;
pub mod embedding;
pub mod error;
pub mod note;
pub mod questions;
pub mod server;
pub mod store;
pub mod sync;
pub mod vector;
pub mod watcher;
