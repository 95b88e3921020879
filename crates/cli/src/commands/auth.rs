//! Auth header inspection

use anyhow::{Context, Result};

use monitor_lib::AuthClaims;

use crate::output::{print_fields, print_json, FieldRow, OutputFormat};

/// Decode and print the claims in an `Agi-Monitor-Auth` header value
pub fn decode_auth(header: &str, format: OutputFormat) -> Result<()> {
    let claims = AuthClaims::decode(header).context("Header is not base64-encoded claims JSON")?;

    match format {
        OutputFormat::Json => print_json(&claims)?,
        OutputFormat::Table => print_fields(claim_rows(&claims)),
    }
    Ok(())
}

fn claim_rows(claims: &AuthClaims) -> Vec<FieldRow> {
    vec![
        FieldRow::new("Instance", &claims.instance_id),
        FieldRow::new("Account/Project", &claims.account_project_id),
        FieldRow::new("Zone", &claims.availability_zone),
        FieldRow::new("Image", &claims.image_id),
        FieldRow::new("Type", &claims.instance_type),
        FieldRow::new("Private IP", &claims.private_ip),
        FieldRow::new("Security Groups", claims.security_groups.join(", ")),
    ]
}
