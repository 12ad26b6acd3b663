// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Standalone helper to provision a node identity ahead of time, e.g. when
//! baking a data directory into a deployment image.

use std::path::PathBuf;

use anyhow::Result;
use meridian_p2p::net::NodeIdentity;

fn main() -> Result<()> {
    let out_dir = std::env::args().nth(1).unwrap_or_else(|| "data/p2p".to_string());
    let data_dir = PathBuf::from(out_dir);
    std::fs::create_dir_all(&data_dir)?;

    let identity = NodeIdentity::load_or_create(&data_dir)?;
    println!("{}", identity.node_id());
    Ok(())
}
