use std::time::Duration;

use serde::{Deserialize, Serialize};
use xmlrpc_reactor::{
    CallError, ChannelPeer, ChannelTransport, Notification, ProtocolError, ProtocolState,
    RemoteProcedure, SerializationError, Session, SessionConfig, Transport, TransportError, Value,
};

fn response(value_xml: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<methodResponse>\n  <params>\n    <param>\n      <value>{value_xml}</value>\n    </param>\n  </params>\n</methodResponse>\n"
    )
}

fn fault_response(code: i64, message: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<methodResponse><fault><value><struct>\
         <member><name>faultCode</name><value><int>{code}</int></value></member>\
         <member><name>faultString</name><value><string>{message}</string></value></member>\
         </struct></value></fault></methodResponse>"
    )
}

/// Answers every request with `handler(body)` until the transport goes away.
fn serve<F>(mut peer: ChannelPeer, mut handler: F)
where
    F: FnMut(&str) -> String + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(request) = peer.next_request().await {
            let body = handler(request.body_text());
            request.respond(body);
        }
    });
}

/// Extracts the text of every `<int>` in a request, a stand-in for a server.
fn int_args(body: &str) -> Vec<i64> {
    body.split("<int>")
        .skip(1)
        .filter_map(|s| s.split("</int>").next())
        .filter_map(|s| s.parse().ok())
        .collect()
}

#[tokio::test]
async fn blocking_call_returns_typed_result() {
    let (transport, peer) = ChannelTransport::pair();
    serve(peer, |body| {
        assert!(body.starts_with("<?xml"));
        assert!(body.contains("<methodName>add</methodName>"));
        let sum: i64 = int_args(body).iter().sum();
        response(&format!("<int>{sum}</int>"))
    });

    let mut session = Session::new(transport);
    let mut add = RemoteProcedure::<i32, (i32, i32)>::new("add");

    assert_eq!(*add.call(&mut session, (2, 40)).await.unwrap(), 42);
    assert_eq!(add.result(), Some(&42));
    assert_eq!(session.state(), ProtocolState::Begin);
}

#[tokio::test]
async fn repeated_calls_reuse_the_session() {
    let (transport, peer) = ChannelTransport::pair();
    serve(peer, |body| {
        let n = int_args(body)[0];
        response(&format!("<int>{}</int>", n * n))
    });

    let mut session = Session::new(transport);
    let mut square = RemoteProcedure::<i64, (i64,)>::new("square");

    for n in 1..=4 {
        assert_eq!(*square.call(&mut session, (n,)).await.unwrap(), n * n);
        assert_eq!(session.state(), ProtocolState::Begin);
        assert!(!session.is_pending());
    }
}

#[tokio::test]
async fn zero_argument_call() {
    let (transport, peer) = ChannelTransport::pair();
    serve(peer, |body| {
        assert!(body.contains("<params></params>"));
        response("<string>pong</string>")
    });

    let mut session = Session::new(transport);
    let mut ping = RemoteProcedure::<String>::new("ping");
    assert_eq!(ping.call(&mut session, ()).await.unwrap(), "pong");
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Account {
    id: u32,
    owner: String,
    tags: Vec<String>,
}

#[tokio::test]
async fn records_travel_both_ways() {
    let (transport, peer) = ChannelTransport::pair();
    serve(peer, |body| {
        assert!(body.contains("<member><name>owner</name><value><string>ada</string></value></member>"));
        response(
            "<struct>\
             <member><name>id</name><value><i4>8</i4></value></member>\
             <member><name>owner</name><value>grace</value></member>\
             <member><name>tags</name><value><array><data>\
             <value><string>x</string></value></data></array></value></member>\
             </struct>",
        )
    });

    let mut session = Session::new(transport);
    let mut update = RemoteProcedure::<Account, (Account, bool)>::new("accounts.update");
    let before = Account {
        id: 7,
        owner: "ada".into(),
        tags: vec![],
    };

    let after = update.call(&mut session, (before, true)).await.unwrap();
    assert_eq!(
        after,
        &Account {
            id: 8,
            owner: "grace".into(),
            tags: vec!["x".into()],
        }
    );
}

#[tokio::test]
async fn fault_is_reported_through_the_fault_channel() {
    let (transport, peer) = ChannelTransport::pair();
    serve(peer, |_| fault_response(4, "Too many parameters"));

    let mut session = Session::new(transport);
    let mut notifications = session.subscribe();
    let mut add = RemoteProcedure::<i32, (i32, i32, i32)>::new("add");

    let err = add.call(&mut session, (1, 2, 3)).await.unwrap_err();
    let fault = err.as_fault().expect("fault");
    assert_eq!(fault.code, 4);
    assert_eq!(fault.message, "Too many parameters");
    assert_eq!(add.result(), None);

    match notifications.try_recv().unwrap() {
        Notification::Fault { method, fault } => {
            assert_eq!(method, "add");
            assert_eq!(fault.code, 4);
        }
        other => panic!("unexpected notification {other:?}"),
    }
    assert_eq!(session.state(), ProtocolState::Begin);
}

#[tokio::test]
async fn malformed_response_is_a_protocol_error() {
    let (transport, peer) = ChannelTransport::pair();
    let mut calls = 0;
    serve(peer, move |_| {
        calls += 1;
        if calls == 1 {
            "<methodResponse><bogus/></methodResponse>".to_string()
        } else {
            response("<boolean>1</boolean>")
        }
    });

    let mut session = Session::new(transport);
    let mut check = RemoteProcedure::<bool>::new("check");

    let err = check.call(&mut session, ()).await.unwrap_err();
    match err {
        CallError::Protocol(ProtocolError::Unexpected { state, event }) => {
            assert_eq!(state, ProtocolState::ResponseBegin);
            assert_eq!(event.to_string(), r#"open("bogus")"#);
        }
        other => panic!("unexpected error {other:?}"),
    }

    assert!(*check.call(&mut session, ()).await.unwrap());
}

#[tokio::test]
async fn truncated_response_is_a_protocol_error() {
    let (transport, peer) = ChannelTransport::pair();
    serve(peer, |_| "<methodResponse><params><param>".to_string());

    let mut session = Session::new(transport);
    let err = session.call("cut", &[]).await.unwrap_err();
    assert_eq!(
        err,
        CallError::Protocol(ProtocolError::UnexpectedEof(ProtocolState::Param))
    );
}

#[tokio::test]
async fn result_shape_mismatch_is_a_deserialization_error() {
    let (transport, peer) = ChannelTransport::pair();
    serve(peer, |_| response("<array><data></data></array>"));

    let mut session = Session::new(transport);
    let mut count = RemoteProcedure::<u32>::new("count");
    let err = count.call(&mut session, ()).await.unwrap_err();
    assert!(matches!(err, CallError::Deserialization(_)), "{err}");
}

#[tokio::test]
async fn serialization_failure_never_reaches_the_transport() {
    let (transport, mut peer) = ChannelTransport::pair();
    let mut session = Session::new(transport);
    let mut scale = RemoteProcedure::<f64, (f64,)>::new("scale");

    let err = scale.call(&mut session, (f64::NAN,)).await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Serialization(SerializationError::NonFinite(_))
    ));
    assert!(!session.is_pending());

    drop(session);
    assert!(peer.next_request().await.is_none());
}

#[tokio::test]
async fn transport_failure_is_passed_through() {
    let (transport, mut peer) = ChannelTransport::pair();
    tokio::spawn(async move {
        while let Some(request) = peer.next_request().await {
            request.fail(TransportError::ConnectionLost("reset by peer".into()));
        }
    });

    let mut session = Session::new(transport);
    let err = session.call("anything", &[]).await.unwrap_err();
    assert_eq!(
        err,
        CallError::Transport(TransportError::ConnectionLost("reset by peer".into()))
    );
    assert_eq!(session.state(), ProtocolState::Begin);
}

#[tokio::test]
async fn begin_delivers_completion_when_driven() {
    let (transport, mut peer) = ChannelTransport::pair();
    let mut session = Session::new(transport);
    let mut notifications = session.subscribe();
    let mut echo = RemoteProcedure::<Vec<String>, (Vec<&str>,)>::new("echo");

    let pending = echo.begin(&mut session, (vec!["a", "b"],)).unwrap();
    assert!(session.is_pending());

    let request = peer.next_request().await.unwrap();
    assert!(request.body_text().contains("<methodName>echo</methodName>"));

    let body = response(
        "<array><data><value><string>a</string></value><value>b</value></data></array>",
    );
    for chunk in body.as_bytes().chunks(7) {
        assert!(request.send_chunk(chunk));
    }
    request.end();

    assert!(session.drive().await);
    assert!(!session.is_pending());

    let result = pending.wait().await.unwrap();
    assert_eq!(result, &vec!["a".to_string(), "b".to_string()]);
    assert_eq!(echo.result().map(Vec::len), Some(2));

    assert!(matches!(
        notifications.try_recv().unwrap(),
        Notification::Finished { ref method, .. } if method == "echo"
    ));

    assert!(!session.drive().await);
}

#[tokio::test]
async fn second_call_while_pending_is_rejected() {
    let (transport, mut peer) = ChannelTransport::pair();
    let mut session = Session::new(transport);
    let mut first = RemoteProcedure::<i32>::new("first");
    let mut second = RemoteProcedure::<i32>::new("second");

    let pending = first.begin(&mut session, ()).unwrap();

    let err = second.call(&mut session, ()).await.unwrap_err();
    assert_eq!(err, CallError::Protocol(ProtocolError::CallInProgress));
    assert!(second.begin(&mut session, ()).is_err());

    let request = peer.next_request().await.unwrap();
    request.respond(response("<int>1</int>"));
    session.drive().await;
    assert_eq!(*pending.wait().await.unwrap(), 1);
}

#[tokio::test]
async fn try_wait_returns_the_call_until_delivered() {
    let (transport, mut peer) = ChannelTransport::pair();
    let mut session = Session::new(transport);
    let mut answer = RemoteProcedure::<i32>::new("answer");

    let pending = answer.begin(&mut session, ()).unwrap();
    let pending = match pending.try_wait() {
        Err(pending) => pending,
        Ok(_) => panic!("delivered before the response arrived"),
    };

    peer.next_request()
        .await
        .unwrap()
        .respond(fault_response(2, "no"));
    session.drive().await;

    match pending.try_wait() {
        Ok(Err(CallError::Fault(fault))) => assert_eq!(fault.code, 2),
        _ => panic!("expected a delivered fault"),
    }
}

#[tokio::test(start_paused = true)]
async fn timeout_aborts_the_call_and_keeps_the_session_usable() {
    let (transport, mut peer) = ChannelTransport::pair();
    let config = SessionConfig::default().with_timeout(Duration::from_secs(2));
    let mut session = Session::with_config(transport, config);
    let mut slow = RemoteProcedure::<i32>::new("slow");

    let err = slow.call(&mut session, ()).await.unwrap_err();
    assert_eq!(err, CallError::Timeout(Duration::from_secs(2)));
    assert!(err.is_timeout());
    assert_eq!(session.state(), ProtocolState::Begin);

    // The late answer to the abandoned call must not surface in the next one.
    let stale = peer.next_request().await.unwrap();
    stale.respond(response("<int>1</int>"));
    serve(peer, |_| response("<int>2</int>"));

    assert_eq!(*slow.call(&mut session, ()).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_applies_to_driven_calls() {
    let (transport, _peer) = ChannelTransport::pair();
    let config = SessionConfig::default().with_timeout(Duration::from_millis(500));
    let mut session = Session::with_config(transport, config);
    let mut slow = RemoteProcedure::<i32>::new("slow");

    let pending = slow.begin(&mut session, ()).unwrap();
    assert!(session.drive().await);
    assert_eq!(
        pending.wait().await.unwrap_err(),
        CallError::Timeout(Duration::from_millis(500))
    );
    assert!(!session.is_pending());
}

#[tokio::test]
async fn multiple_params_mode_returns_every_value() {
    let (transport, peer) = ChannelTransport::pair();
    serve(peer, |_| {
        "<methodResponse><params>\
         <param><value><int>1</int></value></param>\
         <param><value><string>two</string></value></param>\
         </params></methodResponse>"
            .to_string()
    });

    let config = SessionConfig::default().with_multiple_params(true);
    let mut session = Session::with_config(transport, config);
    let value = session.call("pair", &[]).await.unwrap();
    assert_eq!(
        value,
        Value::Array(vec![Value::Int(1), Value::from("two")])
    );
}

#[test]
fn config_reads_from_serialized_form() {
    let config: SessionConfig =
        serde_json::from_str(r#"{"timeout_ms": 1500, "multiple_params": true}"#).unwrap();
    assert_eq!(config.timeout, Duration::from_millis(1500));
    assert!(config.multiple_params);

    let defaults: SessionConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(defaults, SessionConfig::default());
}

/// Sends every answer without ever ending the response.
fn serve_without_end(mut peer: ChannelPeer, body: Vec<u8>) {
    tokio::spawn(async move {
        while let Some(request) = peer.next_request().await {
            request.send_chunk(body.clone());
        }
    });
}

#[tokio::test(start_paused = true)]
async fn complete_response_finishes_the_call_while_the_transport_stays_open() {
    let (transport, peer) = ChannelTransport::pair();
    serve_without_end(peer, response("<int>7</int>").into_bytes());

    let config = SessionConfig::default().with_timeout(Duration::from_secs(1));
    let mut session = Session::with_config(transport, config);
    let mut seven = RemoteProcedure::<i32>::new("seven");

    assert_eq!(*seven.call(&mut session, ()).await.unwrap(), 7);

    let pending = seven.begin(&mut session, ()).unwrap();
    assert!(session.drive().await);
    assert_eq!(*pending.wait().await.unwrap(), 7);
}

#[tokio::test]
async fn invalid_utf8_is_a_protocol_error_in_both_modes() {
    let mut body = response("<string>~</string>").into_bytes();
    let at = body.iter().position(|&b| b == b'~').unwrap();
    body[at] = 0xff;

    let (transport, mut peer) = ChannelTransport::pair();
    tokio::spawn(async move {
        while let Some(request) = peer.next_request().await {
            request.respond(body.clone());
        }
    });

    let mut session = Session::new(transport);
    let mut text = RemoteProcedure::<String>::new("text");

    let blocking = text.call(&mut session, ()).await.unwrap_err();
    assert!(
        matches!(blocking, CallError::Protocol(ProtocolError::Markup(_))),
        "{blocking:?}"
    );

    let pending = text.begin(&mut session, ()).unwrap();
    session.drive().await;
    let driven = pending.wait().await.unwrap_err();
    assert!(
        matches!(driven, CallError::Protocol(ProtocolError::Markup(_))),
        "{driven:?}"
    );
}

#[tokio::test]
async fn session_reports_the_transport_endpoint() {
    let (transport, _peer) = ChannelTransport::pair();
    let session = Session::new(transport.with_endpoint("mem://calc"));
    assert_eq!(session.transport().endpoint(), Some("mem://calc"));
}
