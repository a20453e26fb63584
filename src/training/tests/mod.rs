//! Tests for the training pipeline: losses, learner steps, the epoch loop
//! and checkpointing

pub mod checkpoint_tests;
pub mod loss_tests;

pub mod test_utils;
