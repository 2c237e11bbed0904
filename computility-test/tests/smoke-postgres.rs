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

//! # smoke-postgres
//!
//! Integration tests run against a computilityd configured with the PostgreSQL storage back-end.

use std::{fmt::Display, io, sync::Arc};

use async_trait::async_trait;
use common::{ComputilityTest, Configuration, run_all};
use computility::util::Tables;
use computility_test::{
    Helper,
    quota::{account_detail, internal_token_required, org_delete, org_lifecycle},
    test_healthcheck, test_metrics,
};
use itertools::Itertools;
use libtest_mimic::{Arguments, Failed, Trial};
use secrecy::ExposeSecret;
use snafu::{Backtrace, Snafu, prelude::*};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::runtime::Runtime;
use tracing_subscriber::{
    EnvFilter, Registry,
    filter::LevelFilter,
    fmt,
    layer::SubscriberExt,
};

mod common;

#[derive(Snafu)]
enum Error {
    #[snafu(display("Failed to run the fixture commands: {source}"))]
    Command { source: common::Error },
    #[snafu(display("Error obtaining test configuration: {source}"))]
    Configuration { source: common::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    Filter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to connect to PostgreSQL: {source}"))]
    Pool {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to build a tokio runtime: {source}"))]
    Runtime { source: std::io::Error },
    #[snafu(display("Failed to set the global tracing subscriber: {source}"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Application state shared across all tests
struct State {
    pool: PgPool,
    tables: Tables,
}

impl State {
    pub async fn new(cfg: &Configuration) -> Result<State> {
        Ok(State {
            pool: PgPoolOptions::new()
                .max_connections(2)
                .connect(cfg.postgres.url.expose_secret())
                .await
                .context(PoolSnafu)?,
            tables: Tables::default(),
        })
    }
}

#[async_trait]
impl Helper for State {
    async fn clear(&self) -> std::result::Result<(), Failed> {
        sqlx::query(&format!(
            "TRUNCATE {}, {}, {}, {}",
            self.tables.org, self.tables.detail, self.tables.account, self.tables.account_record
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

inventory::submit!(ComputilityTest {
    name: "000test_healthcheck",
    test_fn: |cfg: Configuration, _helper| Box::pin(test_healthcheck(cfg.computility)),
});

inventory::submit!(ComputilityTest {
    name: "010internal_token_required",
    test_fn: |cfg: Configuration, _helper| {
        Box::pin(internal_token_required(cfg.computility, cfg.internal_token))
    },
});

inventory::submit!(ComputilityTest {
    name: "020org_lifecycle",
    test_fn: |cfg: Configuration, helper| {
        Box::pin(org_lifecycle(cfg.computility, cfg.internal_token, helper))
    },
});

inventory::submit!(ComputilityTest {
    name: "030account_detail",
    test_fn: |cfg: Configuration, helper| {
        Box::pin(account_detail(
            cfg.computility,
            cfg.internal_token,
            cfg.signing_key_id,
            cfg.signing_key,
            cfg.token_issuer,
            helper,
        ))
    },
});

inventory::submit!(ComputilityTest {
    name: "040org_delete",
    test_fn: |cfg: Configuration, helper| {
        Box::pin(org_delete(cfg.computility, cfg.internal_token, helper))
    },
});

inventory::submit!(ComputilityTest {
    name: "050test_metrics",
    test_fn: |cfg: Configuration, _helper| Box::pin(test_metrics(cfg.computility)),
});

fn main() -> Result<()> {
    // sqlx & reqwest are async, while libtest-mimic wants synchronous test functions; own the
    // runtime so each test can `block_on` it.
    let rt = Arc::new(Runtime::new().context(RuntimeSnafu)?);

    // There's no way to add command-line arguments, so configuration comes from the environment:
    let config = Configuration::new().context(ConfigurationSnafu)?;

    let mut args = Arguments::from_args();

    if config.logging {
        let filter = EnvFilter::builder()
            .with_default_directive(
                config
                    .log_level
                    .parse::<LevelFilter>()
                    .unwrap_or(LevelFilter::INFO)
                    .into(),
            )
            .from_env()
            .context(FilterSnafu)?;
        tracing::subscriber::set_global_default(
            Registry::default()
                .with(fmt::Layer::default().compact().with_writer(io::stdout))
                .with(filter),
        )
        .context(SetGlobalDefaultSnafu)?;
    }

    if !config.no_setup {
        let _ = run_all(&config.teardown);
        run_all(&config.setup).context(CommandSnafu)?;
    }

    let state: Arc<dyn Helper + Send + Sync> =
        Arc::new(rt.block_on(async { State::new(&config).await })?);

    // The tests share one daemon & clear its state as they go, so they can't run concurrently.
    if !matches!(args.test_threads, Some(1)) {
        eprintln!("Overriding --test-threads to 1.");
        args.test_threads = Some(1);
    }

    let conclusion = libtest_mimic::run(
        &args,
        inventory::iter::<ComputilityTest>
            .into_iter()
            .sorted_by_key(|t| t.name)
            .map(|test| {
                let rt = rt.clone();
                let cfg = config.clone();
                let state = state.clone();
                Trial::test(test.name, move || {
                    rt.block_on(async { (test.test_fn)(cfg, state).await })
                })
            })
            .collect(),
    );

    if !config.no_teardown {
        let _ = run_all(&config.teardown);
    }

    conclusion.exit();
}
