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

//! # publisher
//!
//! Getting bytes onto a message bus. A [Publisher] takes a topic & a payload & either gets it to
//! the bus or fails; retrying is the caller's business (see [background_tasks]).
//!
//! [background_tasks]: crate::background_tasks

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::{Backtrace, prelude::*};
use tracing::info;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to NATS at {url}: {source}"))]
    Connect {
        url: String,
        source: async_nats::ConnectError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to flush the NATS connection: {source}"))]
    Flush {
        source: async_nats::client::FlushError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to publish to {topic}: {source}"))]
    Publish {
        topic: String,
        source: async_nats::PublishError,
        backtrace: Backtrace,
    },
    #[snafu(display("Publication to {topic} was refused"))]
    Refused { topic: String, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait Publisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Publish to a NATS server
pub struct NatsPublisher {
    client: async_nats::Client,
}

impl NatsPublisher {
    pub async fn connect(url: &str) -> Result<NatsPublisher> {
        let client = async_nats::ConnectOptions::new()
            .name("computilityd")
            .connect(url)
            .await
            .context(ConnectSnafu {
                url: url.to_owned(),
            })?;
        Ok(NatsPublisher { client })
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic.to_owned(), payload)
            .await
            .context(PublishSnafu {
                topic: topic.to_owned(),
            })?;
        // `publish` only hands the message to the client's write buffer; we want to know it left
        // the building before the task is marked complete.
        self.client.flush().await.context(FlushSnafu)
    }
}

/// "Publish" by logging the message
///
/// For deployments with no message bus.
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        info!(topic, payload = %String::from_utf8_lossy(&payload), "published");
        Ok(())
    }
}

/// Keep published messages in memory
///
/// Can be told to refuse the next `n` publications, which is handy for exercising retries.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<VecDeque<(String, Bytes)>>,
    refusals: AtomicUsize,
}

impl MemoryPublisher {
    pub fn new() -> MemoryPublisher {
        MemoryPublisher::default()
    }
    /// Fail the next `n` calls to [Publisher::publish]
    pub fn refuse(&self, n: usize) {
        self.refusals.store(n, Ordering::SeqCst);
    }
    /// Everything published so far, oldest first
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return RefusedSnafu {
                topic: topic.to_owned(),
            }
            .fail();
        }
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back((topic.to_owned(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn memory_publisher_refusals() {
        let publisher = MemoryPublisher::new();
        publisher.refuse(2);
        assert!(publisher.publish("t", Bytes::from_static(b"1")).await.is_err());
        assert!(publisher.publish("t", Bytes::from_static(b"2")).await.is_err());
        assert!(publisher.publish("t", Bytes::from_static(b"3")).await.is_ok());
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1, Bytes::from_static(b"3"));
    }
}
