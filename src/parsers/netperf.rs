//! netperf text output.
//!
//! The result row sits at a fixed distance from the end of the output, which
//! depends on the sub-test. Lines are split on `\n` only, so trailing blank
//! lines count towards the offset.

use crate::error::ParseError;
use crate::records::{MetricRecord, NetperfTest};

/// (line offset from the end, field index) of the throughput value.
fn location(test: NetperfTest) -> (usize, usize) {
    match test {
        NetperfTest::TcpRr | NetperfTest::UdpRr => (3, 5),
        NetperfTest::UdpStream => (4, 5),
        NetperfTest::TcpStream | NetperfTest::TcpMaerts => (2, 4),
    }
}

pub fn parse_throughput(content: &str, test: NetperfTest) -> Result<MetricRecord, ParseError> {
    let (offset, field) = location(test);
    let lines: Vec<&str> = content.split('\n').collect();

    let line = lines
        .len()
        .checked_sub(offset)
        .and_then(|index| lines.get(index))
        .ok_or_else(|| {
            ParseError::MalformedThroughputOutput(format!(
                "{}: expected at least {} lines, got {}",
                test,
                offset,
                lines.len()
            ))
        })?;

    let value = line.split_whitespace().nth(field).ok_or_else(|| {
        ParseError::MalformedThroughputOutput(format!(
            "{}: result line '{}' has no field {}",
            test,
            line.trim(),
            field
        ))
    })?;
    let throughput = value.parse::<f64>().map_err(|_| {
        ParseError::MalformedThroughputOutput(format!("{}: '{}' is not a number", test, value))
    })?;

    MetricRecord::network(test, throughput)
}
