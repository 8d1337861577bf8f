pub mod agenda;
pub mod clock;
pub mod context;
pub mod engine;
pub mod execution;
pub mod expression;
pub mod graph;
pub mod history;
pub mod job;
pub mod node;
pub mod operations;
pub mod propagation;
pub mod repository;
pub mod storage;
pub mod subscription;
pub mod timer;
