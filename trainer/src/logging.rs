use std::{
    fmt::Write as _,
    fs::{File, OpenOptions},
    io::{self, Write},
};

use env_logger::{Env, Target};
use log::kv::{self, VisitSource};

use crate::{Result, experiment::Experiment};

/// Copies every log line to stderr and to the rank's log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Renders the structured fields of a record as ` key=value` pairs.
#[derive(Default)]
struct Fields(String);

impl<'kvs> VisitSource<'kvs> for Fields {
    fn visit_pair(&mut self, key: kv::Key<'kvs>, value: kv::Value<'kvs>) -> std::result::Result<(), kv::Error> {
        let _ = write!(self.0, " {key}={value}");
        Ok(())
    }
}

/// Installs the process wide logger.
///
/// Lines look like `2024-01-01T00:00:00Z | INFO | message key=value`, the filter defaults to
/// `info` and can be overridden through `RUST_LOG`.
///
/// # Arguments
/// * `experiment` - The run whose folder holds the log files.
/// * `rank` - This process' rank, each rank appends to its own `log_<rank>.txt`.
pub fn init(experiment: &Experiment, rank: usize) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(experiment.log_file(rank))?;

    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let mut fields = Fields::default();
            let _ = record.key_values().visit(&mut fields);

            writeln!(
                buf,
                "{} | {} | {}{}",
                buf.timestamp_seconds(),
                record.level(),
                record.args(),
                fields.0
            )
        })
        .target(Target::Pipe(Box::new(Tee { file })))
        .try_init()
        .map_err(io::Error::other)?;

    Ok(())
}
