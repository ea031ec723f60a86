// Interactive operator console.
//
// Reads one command per line and reports on the output stream:
//
//   add <[name@]host:port>   dial a remote relay
//   delete <peer>            close the link to a remote relay
//   show                     list the current links
//   help                     list the commands
//   quit                     shut the relay down
//
// End of input counts as `quit`. Either way the relay is shut down before
// `run_console` returns, so every peer worker has exited by then.

use std::io::{self, BufRead, Write};

use crate::error::RelayError;
use crate::server::RelayCore;
use crate::table::{ConnectionInfo, LinkDirection, LinkState};

const PROMPT: &str = "% ";

const HELP: &str = "\
Commands:
  add <[name@]host:port>   connect to a remote relay
  delete <peer>            disconnect from a remote relay
  show                     list established connections
  help                     show this list
  quit                     shut down and exit
";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Add(String),
    Delete(String),
    Show,
    Help,
    Quit,
    /// Blank line.
    Empty,
    /// Anything else, with the usage hint to print.
    Invalid(&'static str),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Self::Empty;
        };
        let argument = words.next();
        let extra = words.next().is_some();

        match (verb, argument, extra) {
            ("add", Some(address), false) => Self::Add(address.to_owned()),
            ("add", _, _) => Self::Invalid("usage: add <[name@]host:port>"),
            ("delete", Some(peer), false) => Self::Delete(peer.to_owned()),
            ("delete", _, _) => Self::Invalid("usage: delete <peer>"),
            ("show", None, _) => Self::Show,
            ("help", None, _) => Self::Help,
            ("quit", None, _) => Self::Quit,
            _ => Self::Invalid("Command not recognized. Type \"help\" for a list."),
        }
    }
}

/// Run the console until `quit` or end of input, then shut `core` down.
/// Returns the number of peer workers joined by the shutdown.
pub fn run_console<R: BufRead, W: Write>(
    core: RelayCore,
    mut input: R,
    mut output: W,
) -> io::Result<usize> {
    let mut line = String::new();
    loop {
        write!(output, "{PROMPT}")?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            break;
        }

        match Command::parse(&line) {
            Command::Add(address) => match core.add_remote(&address) {
                Ok(peer) => writeln!(output, "Connected to {peer}.")?,
                Err(e) => writeln!(output, "Could not add {address}: {e}")?,
            },
            Command::Delete(peer) => match core.terminate_remote(&peer) {
                Ok(()) => writeln!(output, "Disconnected from {peer}.")?,
                Err(RelayError::NotFound(_)) => {
                    writeln!(output, "No connection to that remote group exists.")?
                }
                Err(e) => writeln!(output, "Could not delete {peer}: {e}")?,
            },
            Command::Show => write_connections(&mut output, &core.list_connections())?,
            Command::Help => write!(output, "{HELP}")?,
            Command::Quit => break,
            Command::Empty => {}
            Command::Invalid(hint) => writeln!(output, "{hint}")?,
        }
    }

    writeln!(output, "Shutting down...")?;
    output.flush()?;
    Ok(core.shutdown())
}

fn write_connections<W: Write>(output: &mut W, connections: &[ConnectionInfo]) -> io::Result<()> {
    if connections.is_empty() {
        return writeln!(output, "No TCP connections currently established.");
    }
    writeln!(output, "{:<24} {:<9} {:<24} STATE", "PEER", "DIRECTION", "ADDRESS")?;
    for info in connections {
        let direction = match info.direction {
            LinkDirection::Dialed => "dialed",
            LinkDirection::Accepted => "accepted",
        };
        let address = info
            .remote_addr
            .map_or_else(|| "-".to_owned(), |addr| addr.to_string());
        let state = match info.state {
            LinkState::Connecting => "connecting",
            LinkState::Active => "active",
            LinkState::Closing => "closing",
            LinkState::Reaped => "reaped",
        };
        writeln!(
            output,
            "{:<24} {direction:<9} {address:<24} {state}",
            info.peer_id.as_str()
        )?;
    }
    Ok(())
}
