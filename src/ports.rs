use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Parse a port specification into a deduplicated list of TCP ports.
///
/// Entries are separated by commas or newlines. Supported entry forms:
/// - single port: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` on a line is ignored
/// - blank entries and surrounding whitespace are ignored
///
/// First-appearance order is preserved, which keeps the sweep order of the
/// ports fetcher predictable.
pub fn parse_port_spec(spec: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (idx, raw_line) in spec.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");
        for entry in line.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some((a, b)) = entry.split_once('-') {
                let start = parse_port(a.trim())
                    .with_context(|| format!("line {line_no}: invalid start of range: {a}"))?;
                let end = parse_port(b.trim())
                    .with_context(|| format!("line {line_no}: invalid end of range: {b}"))?;
                if start > end {
                    bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
            } else {
                let p = parse_port(entry)
                    .with_context(|| format!("line {line_no}: invalid port value: {entry}"))?;
                if seen.insert(p) {
                    out.push(p);
                }
            }
        }
    }

    Ok(out)
}

/// Load a port specification from a file. Errors if the file cannot be
/// read or parsed.
pub fn load_ports_file(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_port_spec(&content)
}

/// A conservative default sweep list of commonly used TCP ports, kept small
/// so the default scan stays fast on a LAN.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 135, 139, 143, 389, 443, 445, 465, 587, 631, 993, 995, 1433,
        1723, 2049, 3000, 3128, 3306, 3389, 5000, 5432, 5900, 5985, 6379, 8000, 8080, 8443, 8888,
        9000, 9200, 11211, 27017,
    ];
    DEFAULT.to_vec()
}

fn parse_port(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_comma_separated_spec() {
        let ports = parse_port_spec("80,443,22").unwrap();
        assert_eq!(ports, vec![80, 443, 22]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_port_spec("8000-8002,80,8001").unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn parse_line_based_file_format() {
        let input = r#"
            # common web ports
            80  # http
            443 # https
            8000-8002, 9000

            # blank lines and spaces should be fine
        "#;
        let ports = parse_port_spec(input).unwrap();
        assert_eq!(ports, vec![80, 443, 8000, 8001, 8002, 9000]);
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!(parse_port_spec("90-80").is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("70000").is_err());
    }

    #[test]
    fn default_has_common_ports() {
        let d = default_ports();
        assert!(d.contains(&22) && d.contains(&80) && d.contains(&443));
    }
}
