// 测试用传输适配器

use crate::transport::{ProgressReporter, TransferError, TransferRequest, TransportAdapter};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// 一次等待测试代码给出结果的传输
pub(crate) struct PendingTransfer<P> {
    pub request: TransferRequest<P>,
    pub progress: ProgressReporter,
    pub abort: CancellationToken,
    respond: oneshot::Sender<Result<String, TransferError>>,
}

impl<P> PendingTransfer<P> {
    pub fn succeed(self, url: String) {
        let _ = self.respond.send(Ok(url));
    }

    #[allow(dead_code)]
    pub fn fail(self, error: TransferError) {
        let _ = self.respond.send(Err(error));
    }

    pub fn acknowledge_abort(self) {
        let _ = self.respond.send(Err(TransferError::Aborted));
    }
}

/// 把每次传输交给测试代码控制的适配器
pub(crate) struct ScriptedTransport<P> {
    calls: mpsc::UnboundedSender<PendingTransfer<P>>,
}

impl<P> ScriptedTransport<P> {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PendingTransfer<P>>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { calls }), rx)
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> TransportAdapter<P> for ScriptedTransport<P> {
    async fn transfer(
        &self,
        request: TransferRequest<P>,
        progress: ProgressReporter,
        abort: CancellationToken,
    ) -> Result<String, TransferError> {
        let (respond, rx) = oneshot::channel();
        let pending = PendingTransfer {
            request,
            progress,
            abort,
            respond,
        };
        if self.calls.send(pending).is_err() {
            return Err(TransferError::Aborted);
        }
        // 测试代码丢弃了 PendingTransfer，视为中止
        rx.await.unwrap_or(Err(TransferError::Aborted))
    }
}

/// 按闭包立即给出结果的适配器（先上报一次 50% 进度）
pub(crate) struct FnTransport<P, F> {
    respond: F,
    _payload: PhantomData<fn(P)>,
}

impl<P, F> FnTransport<P, F>
where
    F: Fn(&TransferRequest<P>) -> Result<String, TransferError>,
{
    pub fn new(respond: F) -> Arc<Self> {
        Arc::new(Self {
            respond,
            _payload: PhantomData,
        })
    }
}

#[async_trait]
impl<P, F> TransportAdapter<P> for FnTransport<P, F>
where
    P: Send + Sync + 'static,
    F: Fn(&TransferRequest<P>) -> Result<String, TransferError> + Send + Sync,
{
    async fn transfer(
        &self,
        request: TransferRequest<P>,
        progress: ProgressReporter,
        abort: CancellationToken,
    ) -> Result<String, TransferError> {
        if abort.is_cancelled() {
            return Err(TransferError::Aborted);
        }
        progress.report(50);
        tokio::task::yield_now().await;
        (self.respond)(&request)
    }
}
