/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Chipset components configuring the address space: DRAM rows and SMRAM windows.
pub mod row;
pub mod smram;

pub use row::{RowConfig, RowController, MemoryRow, MAX_ROWS};
pub use smram::{SmramController, SmramEnable, SmramId, SmramWindow};
