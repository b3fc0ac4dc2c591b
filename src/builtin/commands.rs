//! Reference commands.
//!
//! ```text
//! ECHO <text>      -> <text>\r\n
//! ADD <n> <n> ...  -> <sum>\r\n
//! MULT <n> <n> ... -> <product>\r\n
//! QUIT             -> BYE\r\n, then the session closes
//! ```
//!
//! Replies are always text lines, whatever framing the request came in.

use crate::command::{Command, HandlerResult};
use crate::framing::RequestInfo;
use crate::runtime::{AppSession, CloseReason};
use anyhow::{anyhow, bail, Context};
use bytes::{BufMut, Bytes, BytesMut};

fn reply<S: AppSession>(session: &S, line: &[u8]) {
    let mut buf = BytesMut::with_capacity(line.len() + 2);
    buf.put_slice(line);
    buf.put_slice(b"\r\n");
    session.send(buf.freeze());
}

/// Parse the whitespace-separated integer operands of a request body.
fn operands(body: &[u8]) -> anyhow::Result<Vec<i64>> {
    let text = std::str::from_utf8(body).context("operands are not UTF-8")?;
    let values = text
        .split_whitespace()
        .map(|word| {
            word.parse::<i64>()
                .with_context(|| format!("invalid integer '{word}'"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if values.is_empty() {
        bail!("no operands");
    }
    Ok(values)
}

pub struct Echo;

impl<S: AppSession, R: RequestInfo> Command<S, R> for Echo {
    fn name(&self) -> &str {
        "ECHO"
    }

    fn execute(&self, session: &S, request: &R) -> HandlerResult {
        reply(session, request.body());
        Ok(())
    }
}

pub struct Add;

impl<S: AppSession, R: RequestInfo> Command<S, R> for Add {
    fn name(&self) -> &str {
        "ADD"
    }

    fn execute(&self, session: &S, request: &R) -> HandlerResult {
        let sum = operands(request.body())?
            .into_iter()
            .try_fold(0i64, i64::checked_add)
            .ok_or_else(|| anyhow!("sum overflows"))?;

        reply(session, sum.to_string().as_bytes());
        Ok(())
    }
}

pub struct Mult;

impl<S: AppSession, R: RequestInfo> Command<S, R> for Mult {
    fn name(&self) -> &str {
        "MULT"
    }

    fn execute(&self, session: &S, request: &R) -> HandlerResult {
        let product = operands(request.body())?
            .into_iter()
            .try_fold(1i64, i64::checked_mul)
            .ok_or_else(|| anyhow!("product overflows"))?;

        reply(session, product.to_string().as_bytes());
        Ok(())
    }
}

pub struct Quit;

impl<S: AppSession, R: RequestInfo> Command<S, R> for Quit {
    fn name(&self) -> &str {
        "QUIT"
    }

    fn execute(&self, session: &S, _request: &R) -> HandlerResult {
        session.send(Bytes::from_static(b"BYE\r\n"));
        session.close(CloseReason::Local);
        Ok(())
    }
}
