use tracing::{trace, warn};

use crate::codec::{ScanState, Scanner};
use crate::error::ProtocolError;
use crate::value::Value;
use crate::{Event, Fault};

/// Position within the method response grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Begin,
    ResponseBegin,
    FaultBegin,
    FaultEnd,
    FaultResponseEnd,
    ParamsBegin,
    Param,
    ParamEnd,
    ParamsEnd,
    ResponseEnd,
}

impl ProtocolState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ResponseEnd | Self::FaultResponseEnd)
    }
}

/// How a response ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Fault(Fault),
}

/// Classifies a stream of structural events as a successful response or
/// a fault, decoding the carried value along the way.
///
/// `methodResponse > params > param > value` is a success and
/// `methodResponse > fault > value` a fault. A response may carry no
/// params, in which case the result is `nil`. Only a single param is
/// accepted unless multiple params are enabled, in which case the result
/// is an array of every param value.
#[derive(Debug)]
pub struct ResponseParser {
    state: ProtocolState,
    scanner: Scanner,
    params: Vec<Value>,
    fault: Option<Fault>,
    multiple_params: bool,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: ProtocolState::Begin,
            scanner: Scanner::new(),
            params: Vec::new(),
            fault: None,
            multiple_params: false,
        }
    }

    pub fn with_multiple_params(mut self, enabled: bool) -> Self {
        self.multiple_params = enabled;
        self
    }

    pub fn set_multiple_params(&mut self, enabled: bool) {
        self.multiple_params = enabled;
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns to `Begin`, dropping any partially decoded value.
    pub fn reset(&mut self) {
        self.state = ProtocolState::Begin;
        self.scanner.reset();
        self.params.clear();
        self.fault = None;
    }

    /// Takes the decoded outcome once a terminal state is reached.
    pub fn take_outcome(&mut self) -> Option<Outcome> {
        match self.state {
            ProtocolState::ResponseEnd => {
                let mut params = std::mem::take(&mut self.params);
                let value = if self.multiple_params {
                    Value::Array(params)
                } else {
                    params.pop().unwrap_or(Value::Nil)
                };
                Some(Outcome::Result(value))
            }
            ProtocolState::FaultResponseEnd => self.fault.take().map(Outcome::Fault),
            _ => None,
        }
    }

    pub fn advance(&mut self, event: Event) -> Result<(), ProtocolError> {
        use ProtocolState::*;

        trace!(state = ?self.state, %event, "advance");

        if self.state.is_terminal() {
            if !event.is_blank() {
                warn!(%event, "ignoring event after end of response");
            }
            return Ok(());
        }

        if matches!(self.state, Param | FaultBegin) && self.scanner.state() != ScanState::Complete {
            return self.scan(event);
        }
        if event.is_blank() {
            return Ok(());
        }

        let next = match (self.state, &event) {
            (Begin, Event::Open(name)) if name == "methodResponse" => ResponseBegin,

            (ResponseBegin, Event::Open(name)) if name == "params" => ParamsBegin,
            (ResponseBegin, Event::Open(name)) if name == "fault" => FaultBegin,

            (ParamsBegin, Event::Open(name)) if name == "param" => Param,
            (ParamsBegin, Event::Close(name)) if name == "params" => ParamsEnd,

            (Param, Event::Close(name)) if name == "param" => {
                if let Some(value) = self.scanner.take() {
                    self.params.push(value);
                }
                ParamEnd
            }

            (ParamEnd, Event::Open(name)) if name == "param" && self.multiple_params => Param,
            (ParamEnd, Event::Close(name)) if name == "params" => ParamsEnd,

            (ParamsEnd, Event::Close(name)) if name == "methodResponse" => ResponseEnd,

            (FaultBegin, Event::Close(name)) if name == "fault" => {
                let value = self.scanner.take().unwrap_or(Value::Nil);
                self.fault = Some(Fault::try_from(&value)?);
                FaultEnd
            }

            (FaultEnd, Event::Close(name)) if name == "methodResponse" => FaultResponseEnd,

            (state, _) => {
                return Err(ProtocolError::Unexpected {
                    state,
                    event: event.clone(),
                })
            }
        };

        self.state = next;
        Ok(())
    }

    /// Forwards an event to the scanner while a param or fault value is
    /// being read.
    fn scan(&mut self, event: Event) -> Result<(), ProtocolError> {
        let starts_value = matches!(&event, Event::Open(name) if name == "value");
        if self.scanner.state() == ScanState::Idle && !starts_value && !event.is_blank() {
            return Err(ProtocolError::Unexpected {
                state: self.state,
                event,
            });
        }
        self.scanner.feed(&event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Map;

    fn open(name: &str) -> Event {
        Event::open(name)
    }

    fn close(name: &str) -> Event {
        Event::close(name)
    }

    fn text(chars: &str) -> Event {
        Event::text(chars)
    }

    fn run(parser: &mut ResponseParser, events: Vec<Event>) -> Result<(), ProtocolError> {
        for event in events {
            parser.advance(event)?;
        }
        Ok(())
    }

    fn int_value(n: &str) -> Vec<Event> {
        vec![open("value"), open("int"), text(n), close("int"), close("value")]
    }

    fn success(values: &[&str]) -> Vec<Event> {
        let mut events = vec![open("methodResponse"), open("params")];
        for n in values {
            events.push(open("param"));
            events.extend(int_value(n));
            events.push(close("param"));
        }
        events.extend([close("params"), close("methodResponse")]);
        events
    }

    fn member(name: &str, value: Vec<Event>) -> Vec<Event> {
        let mut events = vec![open("member"), open("name"), text(name), close("name")];
        events.extend(value);
        events.push(close("member"));
        events
    }

    fn fault(members: Vec<Vec<Event>>) -> Vec<Event> {
        let mut events = vec![
            open("methodResponse"),
            open("fault"),
            open("value"),
            open("struct"),
        ];
        for m in members {
            events.extend(m);
        }
        events.extend([
            close("struct"),
            close("value"),
            close("fault"),
            close("methodResponse"),
        ]);
        events
    }

    #[test]
    fn minimal_success_yields_result() {
        let mut parser = ResponseParser::new();
        run(&mut parser, success(&["42"])).unwrap();
        assert_eq!(parser.state(), ProtocolState::ResponseEnd);
        assert_eq!(parser.take_outcome(), Some(Outcome::Result(Value::Int(42))));
    }

    #[test]
    fn states_follow_the_success_path() {
        let mut parser = ResponseParser::new();
        let mut seen = vec![parser.state()];
        for event in success(&["1"]) {
            parser.advance(event).unwrap();
            if seen.last() != Some(&parser.state()) {
                seen.push(parser.state());
            }
        }
        assert_eq!(
            seen,
            vec![
                ProtocolState::Begin,
                ProtocolState::ResponseBegin,
                ProtocolState::ParamsBegin,
                ProtocolState::Param,
                ProtocolState::ParamEnd,
                ProtocolState::ParamsEnd,
                ProtocolState::ResponseEnd,
            ]
        );
    }

    #[test]
    fn empty_params_yield_nil() {
        let mut parser = ResponseParser::new();
        run(&mut parser, success(&[])).unwrap();
        assert_eq!(parser.take_outcome(), Some(Outcome::Result(Value::Nil)));
    }

    #[test]
    fn fault_goes_to_the_fault_channel() {
        let mut parser = ResponseParser::new();
        let events = fault(vec![
            member("faultCode", int_value("4")),
            member(
                "faultString",
                vec![
                    open("value"),
                    open("string"),
                    text("Too many parameters"),
                    close("string"),
                    close("value"),
                ],
            ),
        ]);
        run(&mut parser, events).unwrap();
        assert_eq!(parser.state(), ProtocolState::FaultResponseEnd);
        assert_eq!(
            parser.take_outcome(),
            Some(Outcome::Fault(Fault {
                code: 4,
                message: "Too many parameters".into(),
            }))
        );
    }

    #[test]
    fn unknown_child_of_response_is_rejected() {
        let mut parser = ResponseParser::new();
        parser.advance(open("methodResponse")).unwrap();
        let err = parser.advance(open("bogus")).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Unexpected {
                state: ProtocolState::ResponseBegin,
                event: open("bogus"),
            }
        );
        assert_eq!(
            err.to_string(),
            r#"unexpected open("bogus") in state ResponseBegin"#
        );
    }

    #[test]
    fn unexpected_root_is_rejected() {
        let mut parser = ResponseParser::new();
        let err = parser.advance(open("methodCall")).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Unexpected {
                state: ProtocolState::Begin,
                ..
            }
        ));
    }

    #[test]
    fn fault_without_code_is_a_protocol_error() {
        let mut parser = ResponseParser::new();
        let mut events = fault(vec![member(
            "faultString",
            vec![open("value"), text("oops"), close("value")],
        )]);
        let tail = events.split_off(events.len() - 2);
        run(&mut parser, events).unwrap();
        assert_eq!(parser.state(), ProtocolState::FaultBegin);

        let err = parser.advance(tail[0].clone()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFault(_)), "{err}");
    }

    #[test]
    fn fault_that_is_not_a_struct_is_rejected() {
        let mut parser = ResponseParser::new();
        let mut events = vec![open("methodResponse"), open("fault")];
        events.extend(int_value("3"));
        events.push(close("fault"));
        let err = run(&mut parser, events).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFault(_)));
    }

    #[test]
    fn second_param_is_rejected_by_default() {
        let mut parser = ResponseParser::new();
        let err = run(&mut parser, success(&["1", "2"])).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Unexpected {
                state: ProtocolState::ParamEnd,
                event: open("param"),
            }
        );
    }

    #[test]
    fn multiple_params_collect_into_an_array() {
        let mut parser = ResponseParser::new().with_multiple_params(true);
        run(&mut parser, success(&["1", "2", "3"])).unwrap();
        assert_eq!(
            parser.take_outcome(),
            Some(Outcome::Result(Value::Array(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
            ])))
        );
    }

    #[test]
    fn param_without_value_is_rejected() {
        let mut parser = ResponseParser::new();
        let err = run(
            &mut parser,
            vec![open("methodResponse"), open("params"), open("param"), close("param")],
        )
        .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Unexpected {
                state: ProtocolState::Param,
                event: close("param"),
            }
        );
    }

    #[test]
    fn text_between_elements_is_ignored_unless_meaningful() {
        let mut parser = ResponseParser::new();
        let mut events = Vec::new();
        for event in success(&["5"]) {
            events.push(event);
            events.push(text("\n  "));
        }
        run(&mut parser, events).unwrap();
        assert_eq!(parser.take_outcome(), Some(Outcome::Result(Value::Int(5))));

        let mut parser = ResponseParser::new();
        parser.advance(open("methodResponse")).unwrap();
        assert!(parser.advance(text("junk")).is_err());
    }

    #[test]
    fn trailing_events_after_terminal_are_ignored() {
        let mut parser = ResponseParser::new();
        run(&mut parser, success(&["9"])).unwrap();
        parser.advance(open("extra")).unwrap();
        assert_eq!(parser.state(), ProtocolState::ResponseEnd);
    }

    #[test]
    fn reset_returns_to_begin_and_discards_partial_state() {
        let mut parser = ResponseParser::new();
        run(
            &mut parser,
            vec![open("methodResponse"), open("params"), open("param"), open("value")],
        )
        .unwrap();
        parser.reset();
        assert_eq!(parser.state(), ProtocolState::Begin);
        run(&mut parser, success(&["7"])).unwrap();
        assert_eq!(parser.take_outcome(), Some(Outcome::Result(Value::Int(7))));
    }

    #[test]
    fn struct_results_decode_whole() {
        let mut parser = ResponseParser::new();
        let mut events = vec![
            open("methodResponse"),
            open("params"),
            open("param"),
            open("value"),
            open("struct"),
        ];
        events.extend(member("a", int_value("1")));
        events.extend([
            close("struct"),
            close("value"),
            close("param"),
            close("params"),
            close("methodResponse"),
        ]);
        run(&mut parser, events).unwrap();

        let mut expected = Map::new();
        expected.insert("a".into(), Value::Int(1));
        assert_eq!(
            parser.take_outcome(),
            Some(Outcome::Result(Value::Struct(expected)))
        );
    }
}
