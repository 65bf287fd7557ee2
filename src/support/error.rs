//-
// Copyright (c) 2026, Postern contributors
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A command line arrived with no terminator within the permitted
    /// length.
    #[error("Command line too long")]
    LineTooLong,
    /// A data block grew past the configured maximum message size.
    #[error("Message data exceeds the permitted size")]
    DataTooLarge,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    ConfigParse(#[from] toml::de::Error),
}
