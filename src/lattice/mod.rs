//! Abstract domains: values, environments and call-site partitions.

pub(crate) mod environment;
pub(crate) mod interval;
pub(crate) mod partition;
pub(crate) mod value;

pub(crate) use environment::{ConstantEnvironment, Environment, RESULT_REGISTER};
pub(crate) use interval::SignInterval;
pub(crate) use partition::{ArgumentDomain, ArgumentPartition, CallSiteLabel};
pub(crate) use value::ConstantValue;
