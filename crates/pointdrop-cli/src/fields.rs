// Gateway field parsing for the checkmac commands
//
// Fields come from FIELD=VALUE arguments, from a form body file
// (application/x-www-form-urlencoded, as captured from a callback), or both.
// Arguments override values read from the file.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pointdrop_checkmac::GatewayFields;

/// Builds a field set from an optional form file and FIELD=VALUE arguments.
pub fn collect_fields(form: Option<&Path>, args: &[String]) -> Result<GatewayFields> {
    let mut fields = match form {
        Some(path) => read_form_file(path)?,
        None => GatewayFields::new(),
    };

    for arg in args {
        let (key, value) = parse_field(arg)?;
        fields.insert(key, value);
    }

    if fields.is_empty() {
        return Err(anyhow!(
            "No fields given. Pass FIELD=VALUE arguments or --form <FILE>"
        ));
    }

    Ok(fields)
}

/// Parses a single "FIELD=VALUE" argument. Values may be empty and may contain '='.
pub fn parse_field(arg: &str) -> Result<(String, String)> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid field: '{}'. Expected 'FIELD=VALUE'", arg))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Empty field name in '{}'", arg));
    }

    Ok((key.to_string(), value.to_string()))
}

/// Reads a urlencoded form body from disk.
pub fn read_form_file(path: &Path) -> Result<GatewayFields> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;

    serde_urlencoded::from_str(body.trim())
        .with_context(|| format!("Failed to parse form body in '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("MerchantID=3002607").unwrap(),
            ("MerchantID".to_string(), "3002607".to_string())
        );
        assert_eq!(
            parse_field("ItemName=a=b").unwrap(),
            ("ItemName".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_field("CustomField1=").unwrap(),
            ("CustomField1".to_string(), String::new())
        );
    }

    #[test]
    fn test_parse_field_rejects_malformed() {
        assert!(parse_field("MerchantID").is_err());
        assert!(parse_field("=value").is_err());
    }

    #[test]
    fn test_collect_requires_fields() {
        assert!(collect_fields(None, &[]).is_err());
    }

    #[test]
    fn test_arguments_override_form_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MerchantID=3002607&RtnCode=1&RtnMsg=%E4%BA%A4%E6%98%93%E6%88%90%E5%8A%9F").unwrap();

        let fields = collect_fields(Some(file.path()), &["RtnCode=0".to_string()]).unwrap();
        assert_eq!(fields.get("MerchantID"), Some("3002607"));
        assert_eq!(fields.get("RtnCode"), Some("0"));
        assert_eq!(fields.get("RtnMsg"), Some("交易成功"));
    }

    #[test]
    fn test_missing_form_file() {
        let err = read_form_file(Path::new("/nonexistent/form.txt")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
