//! Parsers for `nvidia-smi --format=csv` output.

use crate::agent::jobs::Pid;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("invalid number `{0}`")]
    Number(String),
    #[error("unknown memory unit `{0}`")]
    Unit(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub uuid: String,
    pub index: u32,
    pub name: String,
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeApp {
    pub pid: Pid,
    pub memory_bytes: u64,
    pub uuid: String,
}

/// Splits one CSV record. Quoted fields may contain commas and have their
/// quotes removed. Fields are trimmed.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;

    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_string()),
            c => field.push(c),
        }
    }
    fields.push(field.trim().to_string());

    fields
}

fn fields<const N: usize>(line: &str) -> Result<[String; N], ParseError> {
    let fields = split_record(line);
    let found = fields.len();

    fields
        .try_into()
        .map_err(|_| ParseError::FieldCount { expected: N, found })
}

/// Parses a number, tolerating a trailing `%` and surrounding whitespace.
fn number<T: std::str::FromStr>(value: &str) -> Result<T, ParseError> {
    value
        .trim_end_matches('%')
        .trim()
        .parse()
        .map_err(|_| ParseError::Number(value.to_string()))
}

/// Converts a value such as `512 MiB` to bytes. A bare number is in MiB,
/// which is what `nounits` output reports.
pub fn memory_bytes(value: &str) -> Result<u64, ParseError> {
    let mut parts = value.split_whitespace();
    let amount: u64 = parts
        .next()
        .ok_or_else(|| ParseError::Number(value.to_string()))
        .and_then(number)?;

    let multiplier: u64 = match parts.next() {
        Some("B") => 1,
        Some("KiB") => 1 << 10,
        None | Some("MiB") => 1 << 20,
        Some("GiB") => 1 << 30,
        Some("TiB") => 1 << 40,
        Some(unit) => return Err(ParseError::Unit(unit.to_string())),
    };

    amount
        .checked_mul(multiplier)
        .ok_or_else(|| ParseError::Number(value.to_string()))
}

/// Data rows of a csv document, with the header line removed.
fn rows(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

/// Parses a `gpu_uuid, index, name, utilization.gpu` row.
pub fn device(line: &str) -> Result<Device, ParseError> {
    let [uuid, index, name, utilization] = fields::<4>(line)?;

    Ok(Device {
        uuid,
        index: number(&index)?,
        name,
        utilization: number(&utilization)?,
    })
}

/// Parses a `pid, used_gpu_memory, gpu_uuid` row.
pub fn compute_app(line: &str) -> Result<ComputeApp, ParseError> {
    let [pid, memory, uuid] = fields::<3>(line)?;

    Ok(ComputeApp {
        pid: number(&pid)?,
        memory_bytes: memory_bytes(&memory)?,
        uuid,
    })
}

/// Parses every data row, handing malformed rows to `skip` instead of
/// aborting the batch.
pub fn parse_rows<T>(
    text: &str,
    parse: impl Fn(&str) -> Result<T, ParseError>,
    mut skip: impl FnMut(&str, ParseError),
) -> Vec<T> {
    rows(text)
        .filter_map(|line| match parse(line) {
            Ok(row) => Some(row),
            Err(e) => {
                skip(line, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = "\
uuid, index, name, utilization.gpu [%]
GPU-5f4a, 0, NVIDIA A100-SXM4-80GB, 37 %
GPU-9c2e, 1, NVIDIA A100-SXM4-80GB, 0 %
";

    const APPS: &str = "\
pid, used_gpu_memory [MiB], gpu_uuid
1234, 512 MiB, GPU-5f4a
1300, 2 GiB, GPU-9c2e
";

    fn parse_all<T>(text: &str, parse: impl Fn(&str) -> Result<T, ParseError>) -> (Vec<T>, usize) {
        let mut skipped = 0;
        let rows = parse_rows(text, parse, |_, _| skipped += 1);
        (rows, skipped)
    }

    #[test]
    fn devices() {
        let (devices, skipped) = parse_all(DEVICES, device);

        assert_eq!(skipped, 0);
        assert_eq!(
            devices[0],
            Device {
                uuid: "GPU-5f4a".into(),
                index: 0,
                name: "NVIDIA A100-SXM4-80GB".into(),
                utilization: 37.0,
            }
        );
        assert_eq!(devices[1].index, 1);
        assert_eq!(devices[1].utilization, 0.0);
    }

    #[test]
    fn quoted_name() {
        let device = device(r#"gpu-uuid-1, 0, "GPUX", 37"#).unwrap();
        assert_eq!(device.name, "GPUX");
        assert_eq!(device.utilization, 37.0);

        let device = super::device(r#"gpu-uuid-2, 3, "Vendor, Model", 5 %"#).unwrap();
        assert_eq!(device.name, "Vendor, Model");
        assert_eq!(device.index, 3);
    }

    #[test]
    fn compute_apps() {
        let (apps, skipped) = parse_all(APPS, compute_app);

        assert_eq!(skipped, 0);
        assert_eq!(
            apps,
            vec![
                ComputeApp {
                    pid: 1234,
                    memory_bytes: 536_870_912,
                    uuid: "GPU-5f4a".into(),
                },
                ComputeApp {
                    pid: 1300,
                    memory_bytes: 2 << 30,
                    uuid: "GPU-9c2e".into(),
                },
            ]
        );
    }

    #[test]
    fn malformed_rows_do_not_stop_the_batch() {
        let text = "\
pid, used_gpu_memory [MiB], gpu_uuid
1, 10 MiB
2, [N/A], GPU-a
abc, 10 MiB, GPU-a
3, 10 MiB, GPU-a
";
        let (apps, skipped) = parse_all(text, compute_app);

        assert_eq!(skipped, 3);
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].pid, 3);
    }

    #[test]
    fn field_count_error() {
        assert_eq!(
            compute_app("1, 10 MiB"),
            Err(ParseError::FieldCount {
                expected: 3,
                found: 2
            })
        );
    }

    #[test]
    fn memory_units() {
        assert_eq!(memory_bytes("512 MiB"), Ok(536_870_912));
        assert_eq!(memory_bytes("512"), Ok(536_870_912));
        assert_eq!(memory_bytes("4 KiB"), Ok(4096));
        assert_eq!(memory_bytes("7 B"), Ok(7));
        assert_eq!(memory_bytes("1 GiB"), Ok(1 << 30));
        assert_eq!(memory_bytes("1 PB"), Err(ParseError::Unit("PB".into())));
        assert!(memory_bytes("[Not Supported]").is_err());
        assert!(memory_bytes("").is_err());
    }

    #[test]
    fn header_only() {
        let (apps, skipped) = parse_all("pid, used_gpu_memory [MiB], gpu_uuid\n", compute_app);
        assert!(apps.is_empty());
        assert_eq!(skipped, 0);
    }
}
