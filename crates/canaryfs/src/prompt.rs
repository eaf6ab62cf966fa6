//! Line-oriented operator prompt.
//!
//! Writes one question per pending request and reads one answer line back.
//! The mounted binary runs it over stdin/stderr; tests run it over byte buffers.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;

use canaryfs_kernel::allowance::ANSWER_HELP;
use canaryfs_kernel::{Answer, DecisionError, DecisionSource, RequestDescriptor};

struct PromptIo<R, W> {
    lines: Lines<R>,
    out: W,
}

/// Decision source backed by a line reader and a writer.
pub struct LinePrompt<R, W> {
    io: Mutex<PromptIo<R, W>>,
}

/// Prompt on the controlling terminal: questions to stderr, answers from stdin.
pub type TerminalPrompt = LinePrompt<BufReader<tokio::io::Stdin>, tokio::io::Stderr>;

impl TerminalPrompt {
    pub fn stdio() -> Self {
        LinePrompt::new(BufReader::new(tokio::io::stdin()), tokio::io::stderr())
    }
}

impl<R, W> LinePrompt<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new(PromptIo {
                lines: reader.lines(),
                out: writer,
            }),
        }
    }

    /// Give back the writer, e.g. to inspect what was printed.
    pub fn into_writer(self) -> W {
        self.io.into_inner().out
    }
}

fn question(request: &RequestDescriptor) -> String {
    format!("[canaryfs] Allow {request}? (Y/n/a or <Ns>/<N>): ")
}

async fn say<W: AsyncWrite + Unpin>(out: &mut W, text: &str) -> Result<(), DecisionError> {
    out.write_all(text.as_bytes())
        .await
        .map_err(|e| DecisionError::Unavailable(e.to_string()))?;
    out.flush()
        .await
        .map_err(|e| DecisionError::Unavailable(e.to_string()))
}

#[async_trait]
impl<R, W> DecisionSource for LinePrompt<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn request(&self, request: &RequestDescriptor) -> Result<Answer, DecisionError> {
        let mut io = self.io.lock().await;
        say(&mut io.out, &question(request)).await?;

        // `next_line` is cancel safe: a timed-out prompt loses no input.
        let line = io
            .lines
            .next_line()
            .await
            .map_err(|e| DecisionError::Unavailable(e.to_string()))?;

        let Some(line) = line else {
            // End of input: nobody left to ask.
            say(&mut io.out, "\n").await?;
            return Ok(Answer::DenyOnce);
        };

        let answer = Answer::parse(&line);
        if let Answer::Invalid(_) = answer {
            say(&mut io.out, &format!("{ANSWER_HELP}\n")).await?;
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canaryfs_kernel::OpKind;
    use canaryfs_kernel::request::RequestSequencer;
    use std::path::Path;
    use std::time::Duration;

    fn prompt(input: &'static str) -> LinePrompt<&'static [u8], Vec<u8>> {
        LinePrompt::new(input.as_bytes(), Vec::new())
    }

    #[tokio::test]
    async fn test_prompt_text_and_answers() {
        let source = prompt("10\n30s\n\n");
        let seq = RequestSequencer::new();
        let read = seq.describe(OpKind::Read, Path::new("/x"));

        assert_eq!(source.request(&read).await, Ok(Answer::AllowForCount(10)));
        assert_eq!(
            source.request(&read).await,
            Ok(Answer::AllowForDuration(Duration::from_secs(30)))
        );
        assert_eq!(source.request(&read).await, Ok(Answer::AllowOnce));

        let printed = String::from_utf8(source.into_writer()).unwrap();
        assert!(printed.starts_with("[canaryfs] Allow read /x? (Y/n/a or <Ns>/<N>): "));
        assert_eq!(printed.matches("[canaryfs] Allow").count(), 3);
    }

    #[tokio::test]
    async fn test_rename_prompt_shows_destination() {
        let source = prompt("y\n");
        let seq = RequestSequencer::new();
        let req = seq.describe_with_dest(OpKind::Rename, Path::new("/a"), Path::new("/b"));

        source.request(&req).await.unwrap();
        let printed = String::from_utf8(source.into_writer()).unwrap();
        assert!(printed.contains("Allow rename /a -> /b?"));
    }

    #[tokio::test]
    async fn test_invalid_answer_prints_help() {
        let source = prompt("maybe\n");
        let seq = RequestSequencer::new();

        let answer = source
            .request(&seq.describe(OpKind::Write, Path::new("/y")))
            .await
            .unwrap();
        assert_eq!(answer, Answer::Invalid("maybe".into()));
        let printed = String::from_utf8(source.into_writer()).unwrap();
        assert!(printed.ends_with(&format!("{ANSWER_HELP}\n")));
    }

    #[tokio::test]
    async fn test_end_of_input_denies() {
        let source = prompt("");
        let seq = RequestSequencer::new();

        let answer = source
            .request(&seq.describe(OpKind::Unlink, Path::new("/z")))
            .await;
        assert_eq!(answer, Ok(Answer::DenyOnce));
    }
}
