use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use yamux::{Config, Session, YamuxError};

/// Helper macro to add timeout to tests
macro_rules! test_with_timeout {
    ($test_name:ident, $timeout_secs:expr, $test_body:block) => {
        #[tokio::test]
        async fn $test_name() {
            let result = tokio::time::timeout(
                Duration::from_secs($timeout_secs),
                async move $test_body
            ).await;

            match result {
                Ok(Ok(())) => {},
                Ok(Err(e)) => panic!("Test failed: {:?}", e),
                Err(_) => panic!("Test timed out after {} seconds", $timeout_secs),
            }
        }
    };
}

/// Bind a listener on an ephemeral local port
async fn local_listener() -> Result<(TcpListener, String), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    Ok((listener, addr))
}

test_with_timeout!(test_e2e_basic_tcp_communication, 30, {
    let (listener, addr) = local_listener().await?;

    let server_handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let server_session = Session::server(socket, Config::default()).await.unwrap();

        let mut server_stream = server_session.accept_stream().await.unwrap();

        let mut buffer = [0u8; 5];
        server_stream.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"hello");

        server_stream.write_all(b"world").await.unwrap();
        server_stream.shutdown().await.unwrap();
        server_session.closed().await
    });

    let socket = TcpStream::connect(&addr).await?;
    let client_session = Session::client(socket, Config::default()).await?;

    let mut client_stream = client_session.open_stream()?;
    client_stream.write_all(b"hello").await?;

    let mut buffer = [0u8; 5];
    client_stream.read_exact(&mut buffer).await?;
    assert_eq!(&buffer, b"world");
    client_stream.shutdown().await?;

    // Closing the client is seen by the server as a go-away
    client_session.close().await?;
    let cause = server_handle.await?;
    assert!(matches!(cause, Some(YamuxError::GoAway)));

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_multiple_streams_tcp, 30, {
    let (listener, addr) = local_listener().await?;

    const NUM_STREAMS: usize = 3;

    let server_handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let server_session = Session::server(socket, Config::default()).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..NUM_STREAMS {
            let mut stream = server_session.accept_stream().await.unwrap();
            tasks.push(tokio::spawn(async move {
                let mut received = Vec::new();
                stream.read_to_end(&mut received).await.unwrap();
                let received = String::from_utf8_lossy(&received);

                // Client streams carry their own id
                let expected = format!("stream {}", stream.stream_id());
                assert_eq!(received, expected);

                let response = format!("echo: {received}");
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    });

    let socket = TcpStream::connect(&addr).await?;
    let client_session = Session::client(socket, Config::default()).await?;

    let mut client_tasks = Vec::new();
    for _ in 0..NUM_STREAMS {
        let mut stream = client_session.open_stream()?;
        client_tasks.push(tokio::spawn(async move {
            let data = format!("stream {}", stream.stream_id());
            stream.write_all(data.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();

            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.unwrap();
            assert_eq!(response, format!("echo: {data}").as_bytes());
        }));
    }

    for task in client_tasks {
        task.await?;
    }
    server_handle.await?;

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_large_data_transfer, 30, {
    let (listener, addr) = local_listener().await?;

    // Several windows' worth of data
    let test_data: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 256) as u8).collect();
    let expected = test_data.clone();

    let server_handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let server_session = Session::server(socket, Config::default()).await.unwrap();
        let mut server_stream = server_session.accept_stream().await.unwrap();

        let mut received_data = Vec::new();
        let mut buffer = [0u8; 4096];
        loop {
            let n = server_stream.read(&mut buffer).await.unwrap();
            if n == 0 {
                break;
            }
            received_data.extend_from_slice(&buffer[..n]);
        }

        assert_eq!(received_data.len(), expected.len());
        assert!(received_data == expected);

        server_stream.write_all(b"received_all").await.unwrap();
        server_stream.shutdown().await.unwrap();
    });

    let socket = TcpStream::connect(&addr).await?;
    let client_session = Session::client(socket, Config::default()).await?;

    let mut client_stream = client_session.open_stream()?;
    client_stream.write_all(&test_data).await?;
    client_stream.shutdown().await?;

    let mut ack_buffer = [0u8; 12];
    client_stream.read_exact(&mut ack_buffer).await?;
    assert_eq!(&ack_buffer, b"received_all");

    server_handle.await?;

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_ping_over_tcp, 30, {
    let (listener, addr) = local_listener().await?;

    let server_handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let server_session = Session::server(socket, Config::default()).await.unwrap();
        server_session.closed().await
    });

    let socket = TcpStream::connect(&addr).await?;
    let client_session = Session::client(socket, Config::default()).await?;

    let rtt = client_session.ping(0).await?;
    assert!(rtt < client_session.config().keep_alive_timeout);

    client_session.close().await?;
    server_handle.await?;

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_e2e_connection_handling, 30, {
    let (listener, addr) = local_listener().await?;

    let server_handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let server_session = Session::server(socket, Config::default()).await.unwrap();

        let _server_stream = server_session.accept_stream().await.unwrap();

        // The client drops its socket: the session ends and accepting fails
        let result = server_session.accept_stream().await;
        assert!(matches!(result, Err(YamuxError::SessionClosed)));
        assert!(server_session.is_closed());
    });

    {
        let socket = TcpStream::connect(&addr).await?;
        let (client_session, mut raw) = {
            let socket = socket.into_std()?;
            let raw = TcpStream::from_std(socket.try_clone()?)?;
            let session = Session::client(TcpStream::from_std(socket)?, Config::default()).await?;
            (session, raw)
        };

        let _client_stream = client_session.open_stream()?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Abrupt disconnect of the underlying socket
        raw.shutdown().await?;
        client_session.closed().await;
    }

    server_handle.await?;

    Ok::<(), Box<dyn std::error::Error>>(())
});
