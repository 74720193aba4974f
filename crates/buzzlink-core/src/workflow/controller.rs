//! 控制器：唯一的所有者任务
//!
//! 所有状态转换和适配器调用都在这个任务上串行执行。
//! 适配器的完成事件、计时器和外部请求都先进入通道，再交给 [`Machine`]。
//! 适配器请求的同步结果作为后续输入，在处理下一条通道消息之前完成。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::ble::adapter::{AdapterEventReceiver, BleAdapter};
use crate::ble::{Command, ConnectionEvent};
use crate::effect::{Effect, Timer, TimerKind};
use crate::platform::Platform;
use crate::workflow::{ControllerConfig, DispatchError, Input, Machine, SendOutcome, Snapshot};

type SendReply = oneshot::Sender<Result<SendOutcome, DispatchError>>;

enum Request {
    Initialize,
    Send { command: Command, reply: SendReply },
    Disconnect,
    Shutdown { reply: oneshot::Sender<()> },
}

/// 控制器句柄，可克隆并在任意任务中使用
#[derive(Clone)]
pub struct ControllerHandle {
    requests: mpsc::UnboundedSender<Request>,
    snapshot: watch::Receiver<Snapshot>,
    command: Command,
}

impl ControllerHandle {
    /// 触发初始化流程（平台探测、权限与开启请求）
    pub fn initialize(&self) -> Result<(), DispatchError> {
        self.requests
            .send(Request::Initialize)
            .map_err(|_| DispatchError::ControllerStopped)
    }

    /// 分发入口，只等待前置条件检查的结果
    pub async fn send(&self, command: Command) -> Result<SendOutcome, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Send { command, reply })
            .map_err(|_| DispatchError::ControllerStopped)?;
        rx.await.map_err(|_| DispatchError::ControllerStopped)?
    }

    /// 发送配置的振动命令
    pub async fn vibrate(&self) -> Result<SendOutcome, DispatchError> {
        self.send(self.command.clone()).await
    }

    pub fn disconnect(&self) -> Result<(), DispatchError> {
        self.requests
            .send(Request::Disconnect)
            .map_err(|_| DispatchError::ControllerStopped)
    }

    /// 断开连接并结束控制器任务
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }
}

pub struct Controller<A, P> {
    machine: Machine,
    adapter: A,
    platform: Arc<P>,
    requests: mpsc::UnboundedReceiver<Request>,
    adapter_events: AdapterEventReceiver,
    /// 计时器与平台回调的内部通道
    internal_tx: mpsc::UnboundedSender<Input>,
    internal_rx: mpsc::UnboundedReceiver<Input>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
    snapshot: watch::Sender<Snapshot>,
}

impl<A, P> Controller<A, P>
where
    A: BleAdapter + 'static,
    P: Platform + 'static,
{
    /// 在当前 tokio 运行时上启动控制器任务
    pub fn spawn(
        adapter: A,
        adapter_events: AdapterEventReceiver,
        platform: Arc<P>,
        config: ControllerConfig,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let machine = Machine::new(config);
        let (snapshot, snapshot_rx) = watch::channel(machine.snapshot());
        let command = machine.config().command.clone();

        let controller = Self {
            machine,
            adapter,
            platform,
            requests,
            adapter_events,
            internal_tx,
            internal_rx,
            timers: HashMap::new(),
            snapshot,
        };
        let task = tokio::spawn(controller.run());

        let handle = ControllerHandle {
            requests: requests_tx,
            snapshot: snapshot_rx,
            command,
        };
        (handle, task)
    }

    async fn run(mut self) {
        debug!("Controller started");
        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        debug!("All controller handles dropped");
                        self.teardown();
                        break;
                    };
                    if let Some(reply) = self.on_request(request).await {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                }
                Some(event) = self.adapter_events.recv() => {
                    self.dispatch(Input::Adapter(event));
                }
                Some(input) = self.internal_rx.recv() => {
                    // 平台回调和计时器都可能依赖最新的权限状态
                    self.refresh_platform().await;
                    self.dispatch(input);
                }
            }
            self.publish();
        }
        self.cancel_all_timers();
        self.publish();
        debug!("Controller stopped");
    }

    /// 返回 `Some` 表示收到关闭请求
    async fn on_request(&mut self, request: Request) -> Option<oneshot::Sender<()>> {
        match request {
            Request::Initialize => {
                self.refresh_platform().await;
                self.dispatch(Input::Initialize);
            }
            Request::Send { command, reply } => {
                self.refresh_platform().await;
                let (outcome, effects) = self.machine.send(&command);
                self.execute(effects);
                let _ = reply.send(outcome);
            }
            Request::Disconnect => self.dispatch(Input::Disconnect),
            Request::Shutdown { reply } => return Some(reply),
        }
        None
    }

    async fn refresh_platform(&mut self) {
        let status = self.platform.probe().await;
        self.machine.observe_platform(status);
    }

    fn teardown(&mut self) {
        info!("Shutting down controller");
        self.dispatch(Input::Disconnect);
    }

    fn dispatch(&mut self, input: Input) {
        let effects = self.machine.handle(input);
        self.execute(effects);
    }

    /// 依次执行副作用，同步结果排队后立即处理
    fn execute(&mut self, effects: Vec<Effect>) {
        let mut follow_ups = VecDeque::new();
        self.apply(effects, &mut follow_ups);
        while let Some(input) = follow_ups.pop_front() {
            let effects = self.machine.handle(input);
            self.apply(effects, &mut follow_ups);
        }
    }

    fn apply(&mut self, effects: Vec<Effect>, follow_ups: &mut VecDeque<Input>) {
        for effect in effects {
            match effect {
                Effect::Status(status) => info!("Status: {}", status),
                Effect::StartScan => {
                    if let Err(failure) = self.adapter.start_scan() {
                        follow_ups.push_back(Input::ScanRejected(failure));
                    }
                }
                Effect::StopScan => self.adapter.stop_scan(),
                Effect::ArmTimer(timer, delay) => self.arm_timer(timer, delay),
                Effect::CancelTimer(kind) => self.cancel_timer(kind),
                Effect::RefreshCache(device) => {
                    let result = self.adapter.refresh_cache(&device);
                    follow_ups.push_back(Input::Connection(ConnectionEvent::CacheRefreshed(result)));
                }
                Effect::DisconnectDevice(device) => self.adapter.disconnect_device(&device),
                Effect::Connect(device) => {
                    let result = self.adapter.connect(&device);
                    follow_ups.push_back(Input::Connection(ConnectionEvent::ConnectIssued(result)));
                }
                Effect::RequestMtu(handle, mtu) => {
                    let result = self.adapter.request_mtu(handle, mtu);
                    follow_ups.push_back(Input::Connection(ConnectionEvent::MtuRequested(result)));
                }
                Effect::DiscoverServices(handle) => {
                    let result = self.adapter.discover_services(handle);
                    follow_ups
                        .push_back(Input::Connection(ConnectionEvent::DiscoveryRequested(result)));
                }
                Effect::Write {
                    handle,
                    characteristic,
                    request,
                } => {
                    let result = self.adapter.write(handle, &characteristic, &request);
                    follow_ups.push_back(Input::Connection(ConnectionEvent::WriteIssued(result)));
                }
                Effect::Disconnect(handle) => self.adapter.disconnect(handle),
                Effect::Close(handle) => self.adapter.close(handle),
                Effect::RequestPermissions(permissions) => {
                    let platform = self.platform.clone();
                    let tx = self.internal_tx.clone();
                    tokio::spawn(async move {
                        let result = platform.request_permissions(&permissions).await;
                        let _ = tx.send(Input::PermissionsResult(result));
                    });
                }
                Effect::RequestEnable => {
                    let platform = self.platform.clone();
                    let tx = self.internal_tx.clone();
                    tokio::spawn(async move {
                        let enabled = platform.request_enable().await;
                        let _ = tx.send(Input::EnableResult(enabled));
                    });
                }
            }
        }
    }

    fn arm_timer(&mut self, timer: Timer, delay: std::time::Duration) {
        self.cancel_timer(timer.kind);
        debug!("Arming {:?} timer for {:?} (epoch {})", timer.kind, delay, timer.epoch);
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Input::Timer(timer));
        });
        self.timers.insert(timer.kind, task);
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(task) = self.timers.remove(&kind) {
            task.abort();
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }

    fn publish(&self) {
        let snapshot = self.machine.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
