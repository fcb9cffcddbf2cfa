pub mod archive;
pub mod collision;
pub mod engine;
pub mod filter;
pub mod report;
pub mod time_expr;

pub use archive::{ArchiveManager, ArchiveResult};
pub use collision::{CollisionAction, CollisionPolicy, CollisionResolver};
pub use engine::{RunPhase, TransferOrchestrator, TransferProgress};
pub use filter::{FileFilter, FilterCriteria};
pub use report::{
    JsonReportSink, LogReportSink, ReportAggregator, ReportSink, RunStatus, TransferOutcome,
    TransferReport,
};
pub use time_expr::TimeExpression;
