// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of computility.
//
// computility is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// computility is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with computility.  If not,
// see <http://www.gnu.org/licenses/>.

//! # The computility Integration Tests
//!
//! Each integration test program in `tests` runs the test functions defined here against a live
//! computilityd configured with one storage back-end. The programs opt out of the default test
//! harness (`harness = false` in Cargo.toml) & drive [libtest-mimic] themselves, which gives us a
//! place to stand up (& tear down) the fixture once for the entire suite.
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
//!
//! Code that's applicable to all integration tests belongs here; code relating to the test
//! framework itself goes in `tests/common`.

use async_trait::async_trait;
use libtest_mimic::Failed;
use reqwest::Url;

pub mod quota;

/// Hit the computilityd healthcheck endpoint; fail on anything other than success.
pub async fn test_healthcheck(url: Url) -> Result<(), Failed> {
    assert_eq!(
        "GOOD",
        reqwest::get(url.join("/healthcheck")?)
            .await?
            .text()
            .await?
    );
    Ok(())
}

/// Hit `/metrics`; run this after [quota::org_lifecycle] so that there's something to see.
pub async fn test_metrics(url: Url) -> Result<(), Failed> {
    let text = reqwest::get(url.join("/metrics")?).await?.text().await?;
    assert!(text.contains("quota_joins"));
    Ok(())
}

/// Back-end specific chores the tests need done
///
/// Each integration test provides an implementation that talks directly to its datastore.
#[async_trait]
pub trait Helper {
    /// Drop all quota state, so that a test starts from a known point
    async fn clear(&self) -> Result<(), Failed>;
}
