pub mod account;
pub mod bar;
pub mod date_range;
pub mod interval;
pub mod order;
pub mod strategy_config;

pub use account::{AccountSnapshot, Position};
pub use bar::{Bar, BarSeries};
pub use date_range::DateRange;
pub use interval::Interval;
pub use order::{Order, OrderStatus, OrderType, Side};
pub use strategy_config::{
    Comparison, Condition, ConditionRule, ConfigChange, ExitCondition, IndicatorKind,
    IndicatorSpec, Parameter, StrategyConfig, Threshold,
};
