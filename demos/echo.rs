use uniserve::{create_server, EventLoop, Request, Response};

fn main() {
    let lp = EventLoop::new().expect("event loop");
    let server = create_server(&lp, |req: Request, res: Response| {
        let reply = format!(
            r#"{{"method": {:?}, "path": {:?}, "body": {:?}}}"#,
            req.method(),
            req.path(),
            req.body_string(),
        );
        res.send_json(&reply)
    });

    server
        .listen(8080, "127.0.0.1", || {
            println!("echoing on http://127.0.0.1:8080")
        })
        .expect("listen");
    lp.run();
}
