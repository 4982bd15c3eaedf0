use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    broadcast::parse_roster,
    cli::ClientArgs,
    codec::{
        DEFAULT_MAX_OUTBOUND_FRAME_LEN, FrameCodec, FrameReader, FrameWriter, read_message,
        write_message,
    },
    error::FrameError,
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    write_message(&mut writer, &args.username)
        .await
        .context("failed to send username")?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    // Relayed frames carry a username prefix, so accept what the relay may send.
    let codec = FrameCodec::new(DEFAULT_MAX_OUTBOUND_FRAME_LEN);
    Ok((
        FrameReader::new(reader, codec.clone()),
        FrameWriter::new(writer, codec),
    ))
}

async fn run_client_loop(
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = read_message(reader) => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(message: Result<Option<String>, FrameError>) -> Result<bool> {
    match message? {
        Some(frame) => {
            write_stdout(&render_frame(&frame)).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut FrameWriter<OwnedWriteHalf>,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    write_message(writer, text).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut FrameWriter<OwnedWriteHalf>) {
    if let Err(error) = writer.get_mut().shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

fn render_frame(frame: &str) -> String {
    match parse_roster(frame) {
        Some(names) => format!("*** online: {}", names.join(", ")),
        None => frame.to_string(),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_frames_render_as_online_list() {
        assert_eq!(render_frame("USERLIST:alice,bob"), "*** online: alice, bob");
    }

    #[test]
    fn chat_frames_render_verbatim() {
        assert_eq!(render_frame("alice: hi"), "alice: hi");
    }
}
