//! Retransform Port
//!
//! Lets conflict resolution re-run a transform for a different DML type
//! without the writer depending on the transform engine.

use crate::domain::entities::{BatchContext, TransformedData};
use crate::domain::errors::TransformError;
use crate::domain::ports::TargetDatabase;
use crate::domain::value_objects::DataEventType;

pub trait Retransform: Send + Sync {
    /// Rebuild `data` from its original source values as if the source
    /// event had been `dml`.
    fn retransform(
        &self,
        data: &TransformedData,
        dml: DataEventType,
        ctx: &BatchContext,
        db: &mut dyn TargetDatabase,
    ) -> Result<Vec<TransformedData>, TransformError>;
}
