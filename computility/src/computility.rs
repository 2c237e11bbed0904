// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of computility.
//
// computility is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// computility is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with computility.  If not,
// see <http://www.gnu.org/licenses/>.

use std::sync::Arc;

use opentelemetry_prometheus_text_exporter::PrometheusExporter;

use crate::{
    authn::InternalToken, metrics::Instruments, quota::QuotaService, signing_keys::SigningKeys,
};

/// Application state available to all handlers
pub struct Computility {
    pub service: QuotaService,
    pub exporter: PrometheusExporter,
    pub instruments: Arc<Instruments>,
    pub internal_token: InternalToken,
    pub signing_keys: SigningKeys,
    /// Expected `iss` claim on web callers' tokens
    pub token_issuer: String,
}
