use super::*;
use crate::config::FairQueueConfig;
use crate::error::{CompleteError, EnqueueError, OpsError};
use crate::item::CompletionStatus;
use crate::storage::MemoryStorage;
use crate::visibility::VisibilityManager;
use std::sync::Arc;

mod common;
use common::*;

mod completion;
mod ops;
