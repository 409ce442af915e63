//! # MTR Core
//!
//! 药物治疗评估 (Medication Therapy Review) 系统的核心模块，提供基础数据结构、
//! 评估台账、错误定义和通用工具。

pub mod error;
pub mod ledger;
pub mod models;
pub mod utils;

pub use error::{MtrError, Result};
pub use ledger::{LedgerSummary, ReviewLedger};
pub use models::*;
