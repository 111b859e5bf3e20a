//! End-to-end coverage of the exchange pipeline and its collaborators.

mod collaborators;
mod common;
mod exchange;
mod key_set_refresh;
