//! CoachClient 测试
//!
//! 进程内起一个最小 HTTP 对端，返回预设响应，验证状态码处理与错误映射。

#[cfg(feature = "transport")]
mod tests {
    use std::sync::{Arc, Once};
    use std::time::Duration;

    use coach_chat_core::protocol::{CONNECTION_LOST_ERROR, GENERIC_STREAM_ERROR};
    use coach_chat_core::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    static NO_PROXY: Once = Once::new();

    /// 本地回环地址不走系统代理
    fn bypass_proxy() {
        NO_PROXY.call_once(|| std::env::set_var("NO_PROXY", "127.0.0.1,localhost"));
    }

    fn client(base_url: &str) -> CoachClient {
        bypass_proxy();
        let mut config = ClientConfig::new(base_url);
        config.request_timeout = Duration::from_millis(300);
        config.stream_idle_timeout = Some(Duration::from_secs(5));
        CoachClient::new(config, Arc::new(StaticToken(Some("tok-123".into())))).unwrap()
    }

    /// 读完整个请求（头 + Content-Length 指定的 body）
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_lowercase()
    }

    /// 只服务一个连接：返回 base URL 和收到的请求（小写）
    async fn serve_once(parts: Vec<Vec<u8>>) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/api/v1", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            for part in parts {
                socket.write_all(&part).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let _ = socket.shutdown().await;
            request
        });
        (base_url, handle)
    }

    fn canned(status: &str, content_type: &str, body: &str) -> Vec<Vec<u8>> {
        vec![format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            content_type,
            body.len(),
            body
        )
        .into_bytes()]
    }

    async fn collect(mut stream: ChatStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    // ==================== 流式 ====================

    #[tokio::test]
    async fn test_stream_rejected_with_detail() {
        let (base_url, server) = serve_once(canned(
            "401 Unauthorized",
            "application/json",
            r#"{"detail":"Invalid token"}"#,
        ))
        .await;

        let events = collect(client(&base_url).stream_chat(ChatRequest::new("Hi", None))).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "Invalid token".into()
            }]
        );

        let request = server.await.unwrap();
        assert!(request.starts_with("post /api/v1/coach/chat/stream "));
        assert!(request.contains("authorization: bearer tok-123"));
        assert!(request.contains("accept: text/event-stream"));
        assert!(request.contains(r#""message":"hi""#));
        assert!(!request.contains("session_id"));
    }

    #[tokio::test]
    async fn test_stream_rejected_without_json_body() {
        let (base_url, _server) =
            serve_once(canned("502 Bad Gateway", "text/html", "<html>bad gateway</html>")).await;

        let events = collect(client(&base_url).stream_chat(ChatRequest::new("Hi", None))).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: GENERIC_STREAM_ERROR.into()
            }]
        );
    }

    #[tokio::test]
    async fn test_stream_success_split_across_writes() {
        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
        let (base_url, _server) = serve_once(vec![
            head.as_bytes().to_vec(),
            b"data: {\"type\":\"token\",\"data\":\"Hel\"}\n\ndata: {\"type\":\"tok".to_vec(),
            b"en\",\"data\":\"lo\"}\n\n".to_vec(),
            b"data: {\"type\":\"done\",\"data\":{\"session_id\":\"srv-1\"}}\n\n".to_vec(),
        ])
        .await;

        let events = collect(
            client(&base_url).stream_chat(ChatRequest::new("Hi", Some("srv-1"))),
        )
        .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::Token("Hel".into()));
        assert_eq!(events[1], StreamEvent::Token("lo".into()));
        match &events[2] {
            StreamEvent::Done(payload) => assert_eq!(payload.session_id.as_deref(), Some("srv-1")),
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/api/v1", listener.local_addr().unwrap());
        drop(listener);

        let events = collect(client(&base_url).stream_chat(ChatRequest::new("Hi", None))).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: CONNECTION_LOST_ERROR.into()
            }]
        );
    }

    // ==================== 非流式 ====================

    #[tokio::test]
    async fn test_chat_success() {
        let body = r#"{"message":"Eat more protein.","session_id":"srv-2","confidence":0.7,"tokens_used":88}"#;
        let (base_url, server) = serve_once(canned("200 OK", "application/json", body)).await;

        let response = client(&base_url)
            .chat(ChatRequest::new("What now?", Some("srv-2")))
            .await
            .unwrap();
        assert_eq!(response.message, "Eat more protein.");
        assert_eq!(response.session_id, "srv-2");
        assert_eq!(response.tokens_used, 88);

        let request = server.await.unwrap();
        assert!(request.starts_with("post /api/v1/coach/chat "));
        assert!(request.contains(r#""session_id":"srv-2""#));
    }

    #[tokio::test]
    async fn test_chat_error_status_maps_to_api_error() {
        let (base_url, _server) = serve_once(canned(
            "422 Unprocessable Entity",
            "application/json",
            r#"{"detail":"Message too long"}"#,
        ))
        .await;

        let err = client(&base_url)
            .chat(ChatRequest::new("Hi", None))
            .await
            .unwrap_err();
        match err {
            Error::Api { status, detail } => {
                assert_eq!(status, 422);
                assert_eq!(detail, "Message too long");
            }
            other => panic!("expected api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chat_timeout_is_distinct() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/api/v1", listener.local_addr().unwrap());
        // 收下请求但不回应
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let err = client(&base_url)
            .chat(ChatRequest::new("Hi", None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(300)));
        server.abort();
    }
}
