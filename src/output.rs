use crate::instruments::Reading;
use crate::poll::Sink;
use csv_core::WriteResult;
use std::io::Write as _;
use std::path::{Path, PathBuf};

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("could not format a CSV row")]
    FormatCsv,
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match &self.format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_header: false },
        };
        Ok(Output { path: self.output, io, formatter })
    }
}

/// Tabular output of one-off commands, in the format selected on the command line.
pub struct Output {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_header: bool },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

impl Output {
    /// Column names for the table and CSV formats. Must precede all rows.
    pub fn headers(&mut self, headers: &[&'static str]) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_header: true } => return Err(Error::FormatCsv),
            Formatter::Csv { written_header } => {
                *written_header = true;
                let line = csv_line(headers)?;
                self.write(&line)?;
            }
            Formatter::Table { comfy } => {
                comfy.set_header(headers.to_vec());
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    /// Add a row; `record` is what gets written in the JSONL format.
    pub fn row<R: serde::Serialize>(
        &mut self,
        cells: Vec<String>,
        record: &R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_header } => {
                *written_header = true;
                let line = csv_line(&cells)?;
                self.write(&line)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(cells);
            }
            Formatter::Jsonl => {
                let mut line = serde_json::to_vec(record).map_err(Error::SerializeJson)?;
                line.push(b'\n');
                self.write(&line)?;
            }
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.io.write_all(bytes).map_err(|e| write_error(self.path.as_deref(), e))
    }

    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy } = &self.formatter {
            let table = format!("{comfy}\n");
            self.write(table.as_bytes())?;
        }
        self.io.flush().map_err(|e| write_error(self.path.as_deref(), e))
    }
}

fn write_error(path: Option<&Path>, e: std::io::Error) -> Error {
    match path {
        None => Error::WriteStdout(e),
        Some(p) => Error::WriteFile(e, p.into()),
    }
}

fn csv_line<V: AsRef<str>>(values: &[V]) -> Result<Vec<u8>, Error> {
    // Quoting at most doubles a field, plus the surrounding quotes. An empty record is written
    // as `""` followed by the terminator.
    let max_len = (2 + 2 * values.iter().map(|v| v.as_ref().len()).max().unwrap_or(0)).max(3);
    let mut buffer = vec![0; max_len];
    let mut writer = csv_core::Writer::new();
    let mut line = Vec::new();
    for (idx, value) in values.iter().enumerate() {
        let input = value.as_ref().as_bytes();
        if idx > 0 {
            let (WriteResult::InputEmpty, written) = writer.delimiter(&mut buffer) else {
                return Err(Error::FormatCsv);
            };
            line.extend_from_slice(&buffer[..written]);
        }
        let (WriteResult::InputEmpty, read, written) = writer.field(input, &mut buffer) else {
            return Err(Error::FormatCsv);
        };
        if read != input.len() {
            return Err(Error::FormatCsv);
        }
        line.extend_from_slice(&buffer[..written]);
    }
    let (WriteResult::InputEmpty, written) = writer.terminator(&mut buffer) else {
        return Err(Error::FormatCsv);
    };
    line.extend_from_slice(&buffer[..written]);
    Ok(line)
}

/// Appends every reading as one line of JSON.
pub struct JsonlSink {
    path: PathBuf,
    file: std::fs::File,
}

impl JsonlSink {
    pub fn open(path: PathBuf) -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::OpenOutputFile(e, path.clone()))?;
        Ok(Self { path, file })
    }
}

impl Sink for JsonlSink {
    fn emit(&mut self, reading: &Reading) -> Result<(), Error> {
        let mut line = serde_json::to_vec(reading).map_err(Error::SerializeJson)?;
        line.push(b'\n');
        self.file.write_all(&line).map_err(|e| Error::WriteFile(e, self.path.clone()))
    }
}
