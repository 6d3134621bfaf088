//! Dispatch: the outer execution loop and the per-instruction match.

mod instruction;
mod main;
