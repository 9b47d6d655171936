use openssl::x509::{X509Name, X509NameRef};

use crate::error::{Error, Result};

const RDN_TYPES: [&str; 11] = [
    "CN",
    "SERIALNUMBER",
    "C",
    "L",
    "ST",
    "STREET",
    "O",
    "OU",
    "POSTALCODE",
    "UID",
    "DC",
];

/// Parse a Distinguished Name string (e.g. `CN=server1,OU=pki,O=acme`) into
/// an X.509 name. Only the RDN types listed in [`RDN_TYPES`] are accepted.
pub fn parse_dn(dn: &str) -> Result<X509Name> {
    if dn.trim().is_empty() {
        return Err(Error::InvalidDn(dn.to_string()));
    }
    let mut name_builder = X509Name::builder()?;
    for rdn in dn.split(',') {
        let (rdn_type, rdn_value) = rdn
            .split_once('=')
            .ok_or_else(|| Error::InvalidDn(dn.to_string()))?;
        let rdn_type = rdn_type.trim();
        let rdn_value = rdn_value.trim();
        if rdn_value.is_empty() || !RDN_TYPES.contains(&rdn_type) {
            return Err(Error::InvalidDn(dn.to_string()));
        }
        name_builder
            .append_entry_by_text(rdn_type, rdn_value)
            .map_err(|_| Error::InvalidDn(dn.to_string()))?;
    }
    Ok(name_builder.build())
}

/// Render an X.509 name back into its `TYPE=value,...` string form.
pub fn format_name(name: &X509NameRef) -> String {
    let mut parts = Vec::new();
    for entry in name.entries() {
        let short_name = match entry.object().nid().short_name() {
            Ok(short_name) => short_name,
            Err(_) => continue,
        };
        // OpenSSL short names diverge from the DN tokens for a few types.
        let entry_type = match short_name {
            "serialNumber" => "SERIALNUMBER",
            "street" => "STREET",
            "postalCode" => "POSTALCODE",
            other => other,
        };
        if let Ok(value) = entry.data().as_utf8() {
            parts.push(format!("{}={}", entry_type, value));
        }
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_dn() {
        let name = parse_dn("CN=cert1,OU=pki").unwrap();
        assert_eq!(format_name(&name), "CN=cert1,OU=pki");
    }

    #[test]
    fn test_parse_full_dn() {
        let name = parse_dn("CN=server,O=acme,OU=ops,C=DE,L=Berlin,ST=BE").unwrap();
        assert_eq!(
            format_name(&name),
            "CN=server,O=acme,OU=ops,C=DE,L=Berlin,ST=BE"
        );
    }

    #[test]
    fn test_parse_dn_trims_whitespace() {
        let name = parse_dn("CN = cert1 , OU = pki").unwrap();
        assert_eq!(format_name(&name), "CN=cert1,OU=pki");
    }

    #[test]
    fn test_parse_invalid_dn() {
        assert!(matches!(parse_dn(""), Err(Error::InvalidDn(_))));
        assert!(matches!(parse_dn("no-equals-sign"), Err(Error::InvalidDn(_))));
        assert!(matches!(parse_dn("CN="), Err(Error::InvalidDn(_))));
        assert!(matches!(parse_dn("X=unknown-type"), Err(Error::InvalidDn(_))));
    }
}
