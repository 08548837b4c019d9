pub mod position_repository;

pub use position_repository::{
    BalanceRecord, InMemoryPositionRepository, PositionRepository, PostgresPositionRepository,
};
