fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

pub mod monitor {
    use crate::connection::{self, SerialConnector};
    use crate::output::{self, JsonlSink};
    use crate::poll::{self, PollLoop};
    use crate::reader;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    /// Poll the controller until interrupted, logging each reading.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        reader: reader::Args,
        #[clap(flatten)]
        poll: poll::Args,
        /// Append every reading to this file as a line of JSON.
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the reading output")]
        Output(#[source] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let sink = args.output.map(JsonlSink::open).transpose().map_err(Error::Output)?;
        let mut poll = PollLoop::new(
            SerialConnector::new(args.connection),
            sink,
            args.reader.timing(),
            args.poll.intervals(),
        );
        let cancel = CancellationToken::new();
        runtime.block_on(async {
            let interrupt = async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("interrupted, shutting down");
                        cancel.cancel();
                    }
                    Err(e) => warn!(
                        message = "cannot listen for interrupts",
                        error = (&e as &dyn std::error::Error)
                    ),
                }
            };
            tokio::join!(poll.run(&cancel), interrupt);
        });
        Ok(())
    }
}

pub mod read {
    use crate::connection::{self, Connect as _, ReadError, SerialConnector};
    use crate::instruments::{
        AlarmState, BasicInstrumentation, DerivedInstrumentation, DiagnosticGeneral, Status,
    };
    use crate::output;
    use crate::reader::{self, RetryingReader, Timing};

    /// Read every snapshot from the controller once.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        reader: reader::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the device")]
        Connect(#[source] connection::Error),
        #[error("could not read the identity of the device")]
        Identity(#[source] ReadError),
        #[error("device did not confirm it is at address {0}")]
        IdentityMismatch(u8),
        #[error("could not read from the device")]
        Read(#[from] reader::Error),
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Row {
        snapshot: &'static str,
        field: &'static str,
        value: String,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let rows = runtime.block_on(read_all(args.connection, args.reader.timing()))?;
        let mut output = args.output.to_output()?;
        output.headers(&["Snapshot", "Field", "Value"])?;
        for row in rows {
            output.row(vec![row.snapshot.into(), row.field.into(), row.value.clone()], &row)?;
        }
        output.commit()?;
        Ok(())
    }

    async fn read_all(connection: connection::Args, timing: Timing) -> Result<Vec<Row>, Error> {
        let mut client = SerialConnector::new(connection).connect().await.map_err(Error::Connect)?;
        if !client.test().await.map_err(Error::Identity)? {
            return Err(Error::IdentityMismatch(client.device_id()));
        }
        let mut reader = RetryingReader::new(client, timing);
        let snapshots = [
            ("status", Status::read(&mut reader).await?.values()),
            ("diagnostic", DiagnosticGeneral::read(&mut reader).await?.values()),
            ("basic", BasicInstrumentation::read(&mut reader).await?.values()),
            ("derived", DerivedInstrumentation::read(&mut reader).await?.values()),
            ("alarms", AlarmState::read(&mut reader).await?.values()),
        ];
        Ok(snapshots
            .into_iter()
            .flat_map(|(snapshot, values)| {
                values.into_iter().map(move |(field, value)| Row { snapshot, field, value })
            })
            .collect())
    }
}

pub mod registers {
    use crate::connection::IDENTITY;
    use crate::instruments::{
        ALARMS, AlarmState, BasicInstrumentation, DerivedInstrumentation, DiagnosticGeneral,
        Status,
    };
    use crate::output;
    use crate::registers::Field;

    /// Search and output the registers read from the controller.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        filter: Option<String>,
    }

    #[derive(serde::Serialize, Debug, PartialEq)]
    pub struct RegisterSchema {
        pub snapshot: &'static str,
        pub name: String,
        pub page: u8,
        pub offset: u8,
        pub address: u16,
        pub bits: u8,
        pub signed: bool,
        pub scale: f64,
        pub sentinel_eligible: bool,
    }

    impl RegisterSchema {
        fn new(snapshot: &'static str, name: String, field: &Field) -> Self {
            let Field { address, descriptor } = *field;
            RegisterSchema {
                snapshot,
                name,
                page: address.page,
                offset: address.offset,
                address: address.linear(),
                bits: descriptor.width.bits(),
                signed: descriptor.signed,
                scale: descriptor.scale,
                sentinel_eligible: descriptor.sentinel_eligible,
            }
        }

        pub fn all_registers() -> impl Iterator<Item = Self> {
            let identity = Field::word(IDENTITY.page, IDENTITY.offset);
            let alarm_bits = AlarmState::BITS.iter().map(|(name, bit)| format!("{name}@{bit}"));
            let snapshots = [
                ("status", Status::FIELDS),
                ("diagnostic", DiagnosticGeneral::FIELDS),
                ("basic", BasicInstrumentation::FIELDS),
                ("derived", DerivedInstrumentation::FIELDS),
            ];
            std::iter::once(Self::new("identity", "device_id".into(), &identity))
                .chain(snapshots.into_iter().flat_map(|(snapshot, fields)| {
                    fields.iter().flat_map(move |(name, fields)| {
                        fields.iter().enumerate().map(move |(phase, field)| {
                            let name = match fields.len() {
                                1 => name.to_string(),
                                _ => format!("{name}[{}]", phase + 1),
                            };
                            Self::new(snapshot, name, field)
                        })
                    })
                }))
                .chain(std::iter::once(Self::new(
                    "alarms",
                    alarm_bits.collect::<Vec<_>>().join(" "),
                    &ALARMS,
                )))
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.name.contains(&pattern)
                || self.snapshot.contains(&pattern)
                || self.address.to_string().contains(&pattern)
                || format!("{}:{}", self.page, self.offset).contains(&pattern)
        }

        fn type_name(&self) -> String {
            format!("{}{}", if self.signed { "i" } else { "u" }, self.bits)
        }
    }

    pub fn run(args: Args) -> Result<(), output::Error> {
        let mut output = args.output.to_output()?;
        output.headers(&[
            "Snapshot", "Field", "Page", "Offset", "Address", "Type", "Scale", "Sentinels",
        ])?;
        for register in RegisterSchema::all_registers() {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            let cells = vec![
                register.snapshot.to_string(),
                register.name.clone(),
                register.page.to_string(),
                register.offset.to_string(),
                register.address.to_string(),
                register.type_name(),
                register.scale.to_string(),
                if register.sentinel_eligible { "yes" } else { "no" }.to_string(),
            ];
            output.row(cells, &register)?;
        }
        output.commit()
    }

}
