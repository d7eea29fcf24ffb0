use super::test_helpers::*;
use crate::error::{Error, GetFileError};
use crate::storage;
use crate::types::{DownloadOutcome, DownloadState, GetFileEvent, Tier};
use std::sync::atomic::Ordering;
