// Copyright (C) 2025 Fetchgate Contributors
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

// C7 (Streaming Strategy) and C8 (Buffering Strategy): the two paths the
// orchestrator dispatches a GET response through once headers arrive, per
// whether `detect_streaming` fires on them (§4.7, §4.8).

pub mod buffering;
pub mod streaming;

pub use buffering::{run_buffering, BufferOutcome};
pub use streaming::{detect_streaming, release_on_end, run_streaming};
