//! Server-sent-event framing of generation events.

use std::{borrow::Cow, convert::Infallible};

use axum::response::sse::{Event, Sse};
use futures::{Stream, StreamExt, stream::BoxStream};

use crate::model::StreamEvent;

pub const END_OF_STREAM: &str = "[END_OF_STREAM]";
pub const ERROR: &str = "[ERROR]";

/// Data carried by the frame for `event`. Carriage returns cannot travel in
/// an SSE field, so they are folded into line feeds.
pub fn payload(event: &StreamEvent) -> Cow<'_, str> {
    match event {
        StreamEvent::Token(text) if text.contains('\r') => {
            Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
        }
        StreamEvent::Token(text) => Cow::Borrowed(text),
        StreamEvent::EndOfStream => Cow::Borrowed(END_OF_STREAM),
        StreamEvent::Error => Cow::Borrowed(ERROR),
    }
}

pub fn frame(event: &StreamEvent) -> Event {
    Event::default().data(payload(event))
}

/// One frame per event, in order, closing after the terminal frame.
pub fn sse_response(
    events: BoxStream<'static, StreamEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let frames = async_stream::stream! {
        let mut events = events;
        while let Some(event) = events.next().await {
            let terminal = event.is_terminal();
            yield Ok(frame(&event));
            if terminal {
                break;
            }
        }
    };
    Sse::new(frames)
}
