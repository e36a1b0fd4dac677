/* Relay Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! Framing relay proxy.
//!
//! Fetches one upstream page per request, rewrites every URL-bearing attribute so follow-up
//! requests route back through the relay endpoint, strips markup and headers that block
//! cross-origin framing, and returns the transformed document (or the raw bytes, base64
//! encoded, for anything that is not markup).

pub mod app;
pub mod config;
pub mod proxy;
pub mod telemetry;
pub mod utils;
