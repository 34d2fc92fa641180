use uniserve::{create_server, EventLoop, Request, Response};

fn main() {
    let lp = EventLoop::new().expect("event loop");
    let server = create_server(&lp, |_req: Request, res: Response| res.send("Hello World!"));

    server
        .listen(8080, "127.0.0.1", || {
            println!("listening on http://127.0.0.1:8080")
        })
        .expect("listen");
    lp.run();
}
