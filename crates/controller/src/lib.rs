/*
 * Stack Controller - Kubernetes dispatcher for CI jobs
 * Copyright (C) 2026 Stack Controller authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Stack controller core library
//!
//! Turns CI jobs into Kubernetes Jobs and watches the resulting pods for
//! failures Kubernetes never reports as terminal (a container stuck in
//! `ImagePullBackOff`), cancelling the upstream job when one is found.

pub mod api;
pub mod tasks;

// Re-export commonly used types
pub use api::{ApiError, BuildkiteClient, JobApi, JobState, UpstreamJob};
pub use tasks::config::ControllerConfig;
pub use tasks::job::{Job, JobAdmitter, JobHandler};
pub use tasks::watch::{ImagePullBackOffWatcher, WatcherPolicy};
pub use tasks::{run_watcher, Error, Result};
