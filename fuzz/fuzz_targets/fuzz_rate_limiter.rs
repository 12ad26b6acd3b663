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

#![no_main]
#![forbid(unsafe_code)]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use meridian_p2p::net::ratelimit::RateLimiter;

#[derive(Clone, Debug, Arbitrary)]
struct Frame {
    size: u16,
    msg_type: u8,
}

#[derive(Clone, Debug, Arbitrary)]
struct Input {
    frames: Vec<Frame>,
}

fuzz_target!(|inp: Input| {
    let mut limiter = RateLimiter::with_defaults();
    limiter.add_peer("fuzz-peer");
    for frame in inp.frames.iter().take(1000) {
        let type_str = match frame.msg_type % 4 {
            0 => "heartbeat",
            1 => "block",
            2 => "transaction",
            _ => "peer_discovery",
        };
        let (_allowed, _reason) = limiter.is_allowed("fuzz-peer", type_str, frame.size as usize);
    }
});
