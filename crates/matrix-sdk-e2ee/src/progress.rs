// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Progress reporting for long running operations.

use crate::migration::MigrationState;

/// Receiver of progress updates.
///
/// Listeners are called synchronously from the task doing the work, they
/// should return quickly. Any `Fn(usize, usize)` closure is a listener that
/// ignores state changes.
pub trait ProgressListener: Send + Sync {
    /// `processed` out of `total` items are done.
    ///
    /// `processed` never decreases within one phase of an operation, and a
    /// phase without items reports `(0, 0)`.
    fn on_progress(&self, processed: usize, total: usize);

    /// The operation entered a new state.
    fn on_state_changed(&self, _state: MigrationState) {}
}

impl<F> ProgressListener for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn on_progress(&self, processed: usize, total: usize) {
        self(processed, total)
    }
}
