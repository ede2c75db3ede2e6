//! `anchor inspect`: classify and filter a PEM bundle

use anchor_cert::{
    by_algo, by_name, by_serial, by_type, CertType, CertificateSet, Filter, PublicKeyAlgorithm,
};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

/// Field filters, all optional; set ones are combined with AND
#[derive(Debug, Default, Clone)]
pub struct InspectFilters {
    pub cert_type: Option<CertType>,
    pub algo: Option<PublicKeyAlgorithm>,
    pub name: Option<String>,
    pub serial: Option<String>,
}

impl InspectFilters {
    pub fn to_filters(&self) -> Vec<Filter> {
        let mut filters = Vec::new();
        if let Some(cert_type) = self.cert_type {
            filters.push(by_type(cert_type));
        }
        if let Some(algo) = self.algo {
            filters.push(by_algo(algo));
        }
        if let Some(name) = &self.name {
            filters.push(by_name(name.clone()));
        }
        if let Some(serial) = &self.serial {
            filters.push(by_serial(serial.to_lowercase()));
        }
        filters
    }
}

/// One line per matching certificate, sorted by identity
pub fn render(pem: &str, filters: &InspectFilters) -> Result<String> {
    let set = CertificateSet::from_pem(pem).context("Failed to load certificates")?;
    let matching = set
        .select(&filters.to_filters())
        .context("Failed to filter certificates")?;

    let mut out = String::new();
    for info in matching.infos() {
        let issuer = matching
            .get(&info)
            .map(|cert| cert.issuer().to_string())
            .unwrap_or_default();
        writeln!(out, "{}  issuer={:?}", info, issuer)?;
    }
    writeln!(out, "{} of {} certificate(s) matched", matching.len(), set.len())?;

    Ok(out)
}

pub fn run(path: &Path, filters: &InspectFilters) -> Result<()> {
    let pem = std::fs::read_to_string(path)
        .context(format!("Failed to read PEM file: {:?}", path))?;

    print!("{}", render(&pem, filters)?);
    Ok(())
}
