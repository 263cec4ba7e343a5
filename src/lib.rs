//! A small decoder-only transformer trained in three stages: pretraining on
//! raw text, supervised fine-tuning on instruction examples, and preference
//! alignment with DPO.

pub mod checkpoint;
pub mod config;
pub mod constants;
pub mod dataset;
pub mod dpo;
pub mod error;
pub mod generate;
pub mod model;
pub mod tokenizer;
pub mod train;
