/*
    Copyright (C) 2020-2023  Rafal Michalski

    This file is part of PCMEM, a Rust library for building PC emulators.

    PCMEM is free software: you can redistribute it and/or modify it under
    the terms of the GNU Lesser General Public License (LGPL) as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    PCMEM is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Lesser General Public License for more details.

    You should have received a copy of the GNU Lesser General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.

    Author contact information: see Cargo.toml file, section [package.authors].
*/
//! PCMEM is a library for building IBM PC compatible emulators.
//!
//! It implements the physical address space of the emulated machine:
//!
//! * [memory::AddressSpace] - the registry of mapping regions, the per-page memory state,
//!   the page cache serving the CPU and the bus, and the translation cache flush contract.
//! * [memory::SystemRam] - the default PC RAM layout.
//! * [chipset::row::RowController] - DRAM rows with chipset-defined boundaries.
//! * [chipset::smram::SmramController] - relocatable System Management RAM windows.
//!
//! The leaf components live in the [pcmem_core] crate and are re-exported from [memory].
//!
//! ```
//! use pcmem::memory::{Accessor, AddressSpace, MemoryConfig, SystemRam};
//!
//! let mut space = AddressSpace::new(MemoryConfig { ram_size: 1 << 20, address_bits: 20 }).unwrap();
//! SystemRam::install(&mut space);
//! space.flush();
//! space.write_byte(Accessor::Cpu, 0x7C00, 0xEA);
//! assert_eq!(space.fetch_byte(0x7C00), 0xEA);
//! ```
pub use pcmem_core;

pub mod memory;
pub mod chipset;
