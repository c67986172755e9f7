#![doc = "bi-publish-core: connection-rewriting publish pipeline for BI documents."]

//! Publishes workbooks and data sources (`.twb`, `.twbx`, `.tds`, `.tdsx`) to
//! an analytics server, embedding target credentials for every connection
//! the document declares.
//!
//! # Usage
//! Build a [`session::PublishSession`] over a [`rest::RestClient`], sign in,
//! and call `publish` with a [`contract::ConnectionResolver`] that knows the
//! target credentials for each connection caption.

pub mod container;
pub mod contract;
pub mod document;
pub mod error;
pub mod extract_policy;
pub mod folders;
pub mod rest;
pub mod rewriter;
pub mod scanner;
pub mod session;
pub mod uploader;
pub mod wire;
