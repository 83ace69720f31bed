//! iotgate Model Library
//!
//! Data model shared by every component of the gateway data plane.
//!
//! # Modules
//!
//! - `types`: variables, values, quality codes and devices
//! - `variable_id`: numeric ID ranges, ID allocation and semantic string IDs
//!
//! # Example
//!
//! ```
//! use iotgate_model::{DataType, StringId, Variable};
//!
//! # fn main() -> errors::GatewayResult<()> {
//! let sid = StringId::new("DV", "PLC001", "TEMP")?.with_index(2);
//! let mut var = Variable::new(100_001, sid.to_string(), DataType::Float64);
//! var.set_value(23.5);
//! assert_eq!(var.string_id, "DV-PLC001-TEMP-2");
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod variable_id;

pub use types::{DataType, Device, Quality, Value, Variable, VariableUpdate};
pub use variable_id::{
    id_kind, is_valid_id, IdGenerator, IdKind, StringId, MAX_CUSTOM_ID, MAX_SYSTEM_ID,
    MIN_CUSTOM_ID, MIN_SYSTEM_ID,
};
