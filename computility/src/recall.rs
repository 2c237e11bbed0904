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

//! # recall
//!
//! Recall events: when a member leaves an org while using more than their remaining balance would
//! cover, the difference has to be clawed back by someone downstream (billing, the space
//! scheduler). We tell them about it by publishing a [RecallInfoList] to the
//! `computility_recalled` topic.
//!
//! Publication happens in the background ([PublishRecall]); see [background_tasks].
//!
//! [background_tasks]: crate::background_tasks

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use tracing::debug;
use uuid::Uuid;

use crate::{
    background_tasks::{self, BackgroundTask, Context, TaggedTask, Task},
    entities::{Account, ComputeType},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to serialize a recall event: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

/// Topic names
#[derive(Clone, Debug, Deserialize)]
pub struct Topics {
    #[serde(rename = "computility-recalled")]
    pub computility_recalled: String,
}

impl Default for Topics {
    fn default() -> Self {
        Topics {
            computility_recalled: "computility_recalled".to_owned(),
        }
    }
}

/// One user's quota to be recalled
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RecallInfo {
    pub user_name: Account,
    pub quota_count: i64,
    pub compute_type: ComputeType,
}

/// The event body
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RecallInfoList {
    pub recall_list: Vec<RecallInfo>,
}

impl RecallInfoList {
    pub fn to_json(&self) -> Result<Bytes, Error> {
        Ok(Bytes::from(serde_json::to_vec(self).context(SerSnafu)?))
    }
}

/// Background task publishing a [RecallInfoList]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PublishRecall {
    event: RecallInfoList,
}

impl PublishRecall {
    pub fn new(recall: RecallInfo) -> PublishRecall {
        PublishRecall {
            event: RecallInfoList {
                recall_list: vec![recall],
            },
        }
    }
}

#[async_trait]
impl Task<Context> for PublishRecall {
    async fn exec(self: Box<Self>, context: Context) -> background_tasks::Result<()> {
        let payload = self.event.to_json().map_err(background_tasks::Error::new)?;
        debug!(
            "Publishing {} to {}",
            String::from_utf8_lossy(&payload),
            context.topics.computility_recalled
        );
        context
            .publisher
            .publish(&context.topics.computility_recalled, payload)
            .await
            .map_err(background_tasks::Error::new)
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(10))
    }
}

// 3f0c6d0e-5a0b-4d0e-9a54-6e2f41c2d7a1
const PUBLISH_RECALL: Uuid = Uuid::from_fields(
    0x3f0c6d0e,
    0x5a0b,
    0x4d0e,
    &[0x9a, 0x54, 0x6e, 0x2f, 0x41, 0xc2, 0xd7, 0xa1],
);

impl TaggedTask<Context> for PublishRecall {
    type Tag = Uuid;
    fn get_tag() -> Self::Tag {
        PUBLISH_RECALL
    }
}

inventory::submit! {
    BackgroundTask {
        id: PUBLISH_RECALL,
        de: |buf| {
            Ok(Box::new(
                rmp_serde::from_slice::<PublishRecall>(buf).context(background_tasks::DeSnafu)?,
            ))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::publisher::MemoryPublisher;

    use std::sync::Arc;

    #[test]
    fn wire_format() {
        let event = RecallInfoList {
            recall_list: vec![RecallInfo {
                user_name: Account::new("alice").unwrap(),
                quota_count: 2,
                compute_type: ComputeType::Npu,
            }],
        };
        let json: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"recall_list": [{"user_name": "alice", "quota_count": 2, "compute_type": "npu"}]})
        );
    }

    #[tokio::test]
    async fn publishes_to_the_configured_topic() {
        let publisher = Arc::new(MemoryPublisher::new());
        let context = Context {
            publisher: publisher.clone(),
            topics: Topics {
                computility_recalled: "recalls".to_owned(),
            },
        };
        let task = PublishRecall::new(RecallInfo {
            user_name: Account::new("alice").unwrap(),
            quota_count: 2,
            compute_type: ComputeType::Npu,
        });
        // Round-trip through the registry, as the processor would
        let buf = rmp_serde::to_vec(&task).unwrap();
        let task = inventory::iter::<BackgroundTask>()
            .find(|t| t.id == PUBLISH_RECALL)
            .map(|t| (t.de)(&buf))
            .unwrap()
            .unwrap();
        task.exec(context).await.unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "recalls");
        let event: RecallInfoList = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(event.recall_list[0].quota_count, 2);
    }

    #[tokio::test]
    async fn publish_failures_fail_the_task() {
        let publisher = Arc::new(MemoryPublisher::new());
        publisher.refuse(1);
        let context = Context {
            publisher: publisher.clone(),
            topics: Topics::default(),
        };
        let task = Box::new(PublishRecall::new(RecallInfo {
            user_name: Account::new("alice").unwrap(),
            quota_count: 2,
            compute_type: ComputeType::Npu,
        }));
        assert!(task.exec(context).await.is_err());
        assert!(publisher.published().is_empty());
    }
}
