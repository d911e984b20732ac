//! memory trace loading

use std::path::Path;

use eyre::{bail, eyre, Result, WrapErr};

/// one trace line: `<hex-addr> <R|W> <cycle> [requester]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRequest {
    pub addr: u64,
    pub is_write: bool,
    pub cycle: u64,
    /// only used by distributed controllers
    pub requester: usize,
}

pub fn load_trace(path: impl AsRef<Path>) -> Result<Vec<TraceRequest>> {
    let text = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("cannot read trace {}", path.as_ref().display()))?;
    let mut requests = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        requests.push(
            parse_line(line).wrap_err_with(|| format!("trace line {}", line_no + 1))?,
        );
    }
    Ok(requests)
}

fn parse_line(line: &str) -> Result<TraceRequest> {
    let mut fields = line.split_whitespace();
    let addr = fields.next().ok_or_else(|| eyre!("missing address"))?;
    let addr = u64::from_str_radix(addr.trim_start_matches("0x"), 16)
        .wrap_err_with(|| format!("bad address {:?}", addr))?;
    let is_write = match fields.next() {
        Some("R") | Some("READ") => false,
        Some("W") | Some("WRITE") => true,
        other => bail!("bad access kind {:?}", other),
    };
    let cycle = fields
        .next()
        .ok_or_else(|| eyre!("missing cycle"))?
        .parse::<u64>()?;
    let requester = match fields.next() {
        Some(field) => field.parse::<usize>()?,
        None => 0,
    };
    Ok(TraceRequest {
        addr,
        is_write,
        cycle,
        requester,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_kinds_and_comments() {
        let dir = std::env::temp_dir().join("memctrl_sim_trace_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("small.trace");
        std::fs::write(
            &path,
            "# warmup\n0x2AE00 WRITE 0\n0x1000 R 5 2\n\n2ae00 READ 6\n",
        )
        .unwrap();
        let trace = load_trace(&path).unwrap();
        assert_eq!(trace.len(), 3);
        assert_eq!(
            trace[0],
            TraceRequest {
                addr: 0x2AE00,
                is_write: true,
                cycle: 0,
                requester: 0
            }
        );
        assert_eq!(trace[1].requester, 2);
        assert!(!trace[2].is_write);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_line("0x10 X 3").is_err());
        assert!(parse_line("zzz R 3").is_err());
        assert!(parse_line("0x10 R").is_err());
    }
}
